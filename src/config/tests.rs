use super::*;
use tempfile::TempDir;

#[test]
fn defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();

    assert_eq!(config.ollama.batch_size, 128);
    assert_eq!(config.ollama.image_batch_size, 8);
    assert_eq!(config.chunking.chunk_token_size, 1200);
    assert_eq!(config.chunking.chunk_overlap, 100);
    assert_eq!(config.retrieval.similarity_threshold, 0.4);
    assert_eq!(config.index.m, 16);
}

#[test]
fn missing_file_loads_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(dir.path()).unwrap();

    assert_eq!(config, Config {
        base_dir: dir.path().to_path_buf(),
        ..Config::default()
    });
}

#[test]
fn save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();

    let mut config = Config::load(dir.path()).unwrap();
    config.ollama.model = "custom-model".to_string();
    config.namespace = "my_ns".to_string();
    config.chunking.split_by_character = Some("\n\n".to_string());
    config.save().unwrap();

    let loaded = Config::load(dir.path()).unwrap();
    assert_eq!(loaded.ollama.model, "custom-model");
    assert_eq!(loaded.namespace, "my_ns");
    assert_eq!(loaded.chunking.split_by_character.as_deref(), Some("\n\n"));
}

#[test]
fn partial_toml_fills_defaults() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("config.toml"),
        "[ollama]\nmodel = \"other\"\n",
    )
    .unwrap();

    let config = Config::load(dir.path()).unwrap();
    assert_eq!(config.ollama.model, "other");
    assert_eq!(config.ollama.port, 11434);
    assert_eq!(config.retrieval.top_k, 5);
}

#[test]
fn invalid_toml_is_an_error() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("config.toml"), "not = [valid").unwrap();
    assert!(Config::load(dir.path()).is_err());
}

#[test]
fn rejects_bad_protocol() {
    let mut config = Config::default();
    config.ollama.protocol = "ftp".to_string();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidProtocol(_))
    ));
}

#[test]
fn rejects_overlap_not_smaller_than_chunk_size() {
    let mut config = Config::default();
    config.chunking.chunk_token_size = 100;
    config.chunking.chunk_overlap = 100;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidChunkOverlap(100, 100))
    ));
}

#[test]
fn rejects_out_of_range_threshold() {
    let mut config = Config::default();
    config.retrieval.similarity_threshold = 1.5;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidSimilarityThreshold(_))
    ));
}

#[test]
fn rejects_ef_construction_below_m() {
    let mut config = Config::default();
    config.index.ef_construction = 8;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidEfConstruction(8, 16))
    ));
}

#[test]
fn rejects_unsafe_namespace() {
    let mut config = Config::default();
    config.namespace = "../escape".to_string();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidNamespace(_))
    ));
}

#[test]
fn derived_paths() {
    let config = Config {
        base_dir: PathBuf::from("/data/rag"),
        ..Config::default()
    };

    assert_eq!(config.working_dir(), PathBuf::from("/data/rag/workspace"));
    assert_eq!(config.update_dir_path(), PathBuf::from("/data/rag/update"));
    assert_eq!(config.image_namespace(), "rag_image");
}

#[test]
fn ollama_url_formatting() {
    let config = OllamaConfig::default();
    let url = config.ollama_url().unwrap();
    assert_eq!(url.as_str(), "http://localhost:11434/");
}
