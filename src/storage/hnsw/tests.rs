use super::*;

fn unit(mut v: Vec<f32>) -> Vec<f32> {
    normalize(&mut v);
    v
}

fn axis(dim: usize, i: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[i] = 1.0;
    v
}

#[test]
fn empty_graph_pads_every_position() {
    let graph = HnswGraph::new(4, HnswParams::default());
    let results = graph.search(&[1.0, 0.0, 0.0, 0.0], 3);
    assert_eq!(results, vec![(INVALID_SLOT, 0.0); 3]);
}

#[test]
fn slots_are_assigned_in_insertion_order() {
    let mut graph = HnswGraph::new(3, HnswParams::default());
    for i in 0u32..5 {
        let slot = graph.add_point(unit(vec![i as f32 + 1.0, 1.0, 0.5])).unwrap();
        assert_eq!(slot, i);
    }
    assert_eq!(graph.ntotal(), 5);
}

#[test]
fn rejects_mismatched_dimension() {
    let mut graph = HnswGraph::new(4, HnswParams::default());
    let err = graph.add_point(vec![1.0, 0.0]).unwrap_err();
    assert!(matches!(err, RagError::Index(_)));
    assert!(graph.is_empty());
}

#[test]
fn rejects_empty_vector() {
    let mut graph = HnswGraph::new(4, HnswParams::default());
    assert!(graph.add_point(Vec::new()).is_err());
}

#[test]
fn exact_match_ranks_first() {
    let mut graph = HnswGraph::new(8, HnswParams::default());
    for i in 0..8 {
        graph.add_point(axis(8, i)).unwrap();
    }

    let results = graph.search(&axis(8, 3), 2);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, 3);
    assert!((results[0].1 - 1.0).abs() < 1e-6);
}

#[test]
fn short_graph_pads_tail_with_sentinel() {
    let mut graph = HnswGraph::new(4, HnswParams::default());
    graph.add_point(unit(vec![1.0, 0.2, 0.0, 0.0])).unwrap();
    graph.add_point(unit(vec![0.0, 1.0, 0.3, 0.0])).unwrap();

    let results = graph.search(&unit(vec![1.0, 0.1, 0.0, 0.0]), 5);
    assert_eq!(results.len(), 5);
    assert!(results[0].0 >= 0);
    assert!(results[1].0 >= 0);
    for &(slot, score) in &results[2..] {
        assert_eq!(slot, INVALID_SLOT);
        assert_eq!(score, 0.0);
    }
}

#[test]
fn scores_are_sorted_descending() {
    let mut graph = HnswGraph::new(3, HnswParams::default());
    for i in 0..20 {
        let angle = i as f32 * 0.3;
        graph
            .add_point(unit(vec![angle.cos(), angle.sin(), 0.1]))
            .unwrap();
    }

    let results = graph.search(&unit(vec![1.0, 0.0, 0.1]), 10);
    for pair in results.windows(2) {
        if pair[1].0 == INVALID_SLOT {
            break;
        }
        assert!(pair[0].1 >= pair[1].1);
    }
}

#[test]
fn recall_on_clustered_vectors() {
    // Two well-separated clusters; every query must stay in its own
    // cluster for the top hit.
    let mut graph = HnswGraph::new(6, HnswParams::default());
    let mut cluster_a = Vec::new();
    let mut cluster_b = Vec::new();

    for i in 0..30 {
        let jitter = (i as f32) * 0.001;
        let a = unit(vec![1.0, jitter, 0.0, 0.0, 0.0, 0.0]);
        let b = unit(vec![0.0, 0.0, 0.0, 0.0, jitter, 1.0]);
        cluster_a.push(graph.add_point(a).unwrap());
        cluster_b.push(graph.add_point(b).unwrap());
    }

    let hit_a = graph.search(&unit(vec![1.0, 0.01, 0.0, 0.0, 0.0, 0.0]), 1)[0];
    let hit_b = graph.search(&unit(vec![0.0, 0.0, 0.0, 0.0, 0.01, 1.0]), 1)[0];

    assert!(cluster_a.contains(&(hit_a.0 as u32)));
    assert!(cluster_b.contains(&(hit_b.0 as u32)));
}

#[test]
fn serialize_round_trip_preserves_search() {
    let mut graph = HnswGraph::new(5, HnswParams::default());
    for i in 0..40 {
        let angle = i as f32 * 0.17;
        graph
            .add_point(unit(vec![
                angle.cos(),
                angle.sin(),
                (angle * 0.5).cos(),
                0.2,
                0.1,
            ]))
            .unwrap();
    }

    let bytes = graph.serialize();
    let restored = HnswGraph::deserialize(&bytes).unwrap();

    assert_eq!(restored.dim(), 5);
    assert_eq!(restored.ntotal(), 40);
    assert_eq!(restored.params(), graph.params());

    let query = unit(vec![0.9, 0.1, 0.3, 0.2, 0.1]);
    assert_eq!(graph.search(&query, 8), restored.search(&query, 8));
}

#[test]
fn deserialize_rejects_bad_magic() {
    let err = HnswGraph::deserialize(&[0u8; 32]).unwrap_err();
    assert!(matches!(err, RagError::Index(_)));
}

#[test]
fn deserialize_rejects_truncated_input() {
    let mut graph = HnswGraph::new(4, HnswParams::default());
    graph.add_point(unit(vec![1.0, 0.0, 0.0, 0.0])).unwrap();
    let bytes = graph.serialize();

    let err = HnswGraph::deserialize(&bytes[..bytes.len() - 3]).unwrap_err();
    assert!(matches!(err, RagError::Index(_)));
}

#[test]
fn stored_vectors_are_retrievable_by_slot() {
    let mut graph = HnswGraph::new(3, HnswParams::default());
    let v = unit(vec![0.3, 0.4, 0.5]);
    let slot = graph.add_point(v.clone()).unwrap();

    assert_eq!(graph.vector(slot as usize), Some(v.as_slice()));
    assert_eq!(graph.vector(99), None);
}

#[test]
fn normalize_produces_unit_length() {
    let mut v = vec![3.0, 4.0];
    normalize(&mut v);
    let norm = dot(&v, &v).sqrt();
    assert!((norm - 1.0).abs() < 1e-6);

    // zero vector stays untouched
    let mut z = vec![0.0, 0.0];
    normalize(&mut z);
    assert_eq!(z, vec![0.0, 0.0]);
}
