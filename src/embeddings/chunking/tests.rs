use super::*;

#[test]
fn tokenizer_round_trip_is_lossless() {
    let samples = [
        "plain ascii words",
        "  leading and trailing  spaces  ",
        "punctuation, brackets (and) [more]!",
        "mixed 中文 and ελληνικά text",
        "newlines\nand\ttabs survive",
        "",
    ];

    for text in samples {
        let tokens = tokenize(text);
        assert_eq!(detokenize(&tokens), text);
    }
}

#[test]
fn empty_text_yields_no_chunks() {
    assert!(chunk_text("", 100, 10, None).is_empty());
    assert!(chunk_text("", 100, 10, Some("\n")).is_empty());
}

#[test]
fn short_text_is_a_single_chunk() {
    let chunks = chunk_text("one short sentence", 100, 10, None);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_index, 0);
    assert_eq!(chunks[0].content, "one short sentence");
}

#[test]
fn token_windows_carry_start_offsets() {
    // "a b c d e f" tokenizes to 11 word-bound tokens (words plus the
    // spaces between them). size 4, overlap 1 -> step 3.
    let text = "a b c d e f";
    assert_eq!(token_count(text), 11);

    let chunks = chunk_text(text, 4, 1, None);
    let indices: Vec<u64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices, vec![0, 3, 6, 9]);

    // consecutive windows share the overlap token
    let first = tokenize(&chunks[0].content);
    let second = tokenize(&chunks[1].content);
    assert_eq!(first.last(), second.first());
}

#[test]
fn token_windows_cover_the_whole_text() {
    let text = "alpha beta gamma delta epsilon zeta eta theta";
    let chunks = chunk_text(text, 5, 2, None);

    // starting offsets advance by step and the final window reaches the
    // end of the token stream
    let tokens = tokenize(text);
    let last = chunks.last().unwrap();
    assert_eq!(
        last.chunk_index as usize + last.token_count,
        tokens.len()
    );
}

#[test]
fn character_split_enumerates_chunks() {
    let text = "first part\n\nsecond part\n\nthird part";
    let chunks = chunk_text(text, 100, 10, Some("\n\n"));

    assert_eq!(chunks.len(), 3);
    let indices: Vec<u64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(chunks[0].content, "first part");
    assert_eq!(chunks[2].content, "third part");
}

#[test]
fn character_split_rechunks_oversized_pieces() {
    // second piece is far over the 4-token budget and gets re-cut, but
    // the final list is still enumerated 0..n
    let text = "short\nthis one has quite a few more words than allowed\nend";
    let chunks = chunk_text(text, 4, 1, Some("\n"));

    assert!(chunks.len() > 3);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as u64);
        assert!(chunk.token_count <= 4);
    }
    assert_eq!(chunks.first().unwrap().content, "short");
    assert_eq!(chunks.last().unwrap().content, "end");
}

#[test]
fn chunk_index_semantics_differ_between_modes() {
    // Same text, same budgets: token mode numbers by token offset,
    // character mode numbers by list position.
    let text = "w x y z w x y z w x y z";
    let token_mode = chunk_text(text, 6, 2, None);
    let char_mode = chunk_text(text, 6, 2, Some("\n"));

    assert!(token_mode.len() > 1);
    assert!(token_mode[1].chunk_index > 1);
    assert!(char_mode.iter().enumerate().all(|(i, c)| c.chunk_index == i as u64));
}

#[test]
fn overlap_larger_than_size_is_clamped() {
    // must terminate rather than loop forever
    let chunks = chunk_text("a b c d e f g h", 2, 10, None);
    assert!(!chunks.is_empty());
}
