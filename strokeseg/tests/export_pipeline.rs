mod common;

use std::path::Path;

use common::{synthetic_sample, tiny_model, TestBackend};
use image::DynamicImage;
use strokeseg::{
    build_engine,
    data::SampleSource,
    export::{CheckpointLease, Engine, Graph},
    export_graph, ArtifactStore, BackendKind, Checkpoint, EngineBuildConfig, ExportConfig,
    InferenceEngine, ModelArtifact, ModelConfig, MonitoredMetric, Precision, PreprocessConfig, StrokeSegError,
};

fn save_checkpoint(dir: &Path) -> Checkpoint {
    save_checkpoint_with(dir, tiny_model())
}

fn save_checkpoint_with(dir: &Path, config: ModelConfig) -> Checkpoint {
    let device = Default::default();
    let model = config.init::<TestBackend>(&device).unwrap();
    Checkpoint::save(
        dir,
        &model,
        &config,
        &PreprocessConfig::new(),
        1,
        MonitoredMetric::Dice,
        0.5,
    )
    .unwrap()
}

fn sample_image() -> DynamicImage {
    match synthetic_sample(1).source {
        SampleSource::Memory { image, .. } => image,
        SampleSource::File { .. } => unreachable!(),
    }
}

#[test]
fn checkpoint_graph_and_engine_agree() {
    let run = tempfile::tempdir().unwrap();
    let checkpoint = save_checkpoint(&run.path().join("best"));
    let store = ArtifactStore::open(run.path().join("store")).unwrap();
    let device = Default::default();

    let graph_path =
        export_graph::<TestBackend>(&checkpoint, &store, &ExportConfig::new(), &device).unwrap();
    let engine_path = build_engine::<TestBackend>(
        &checkpoint,
        &store,
        &EngineBuildConfig::new(),
        &ExportConfig::new(),
        &device,
    )
    .unwrap();

    let graph = Graph::read(&graph_path).unwrap();
    assert_eq!(graph.header.source_hash, checkpoint.content_hash());

    let image = sample_image();
    let predictions: Vec<_> = [
        ModelArtifact::Checkpoint(checkpoint.dir().to_path_buf()),
        ModelArtifact::Graph(graph_path),
        ModelArtifact::Engine(engine_path),
    ]
    .iter()
    .map(|artifact| {
        InferenceEngine::<TestBackend>::load(artifact, device)
            .unwrap()
            .predict(&image, 0.5)
            .unwrap()
    })
    .collect();

    let reference = &predictions[0];
    assert_eq!(reference.backend, BackendKind::Checkpoint);
    for candidate in &predictions[1..] {
        assert_eq!((candidate.height, candidate.width), (64, 64));
        let max_diff = reference
            .probability_map
            .iter()
            .zip(&candidate.probability_map)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff < 1e-3, "{}: {max_diff}", candidate.backend);
        assert!(reference.mask_disagreement(candidate) <= 0.01);
    }
}

#[test]
fn repeated_export_reuses_stored_artifacts() {
    let run = tempfile::tempdir().unwrap();
    let checkpoint = save_checkpoint(&run.path().join("best"));
    let store = ArtifactStore::open(run.path().join("store")).unwrap();
    let device = Default::default();
    let config = ExportConfig::new();

    let first = export_graph::<TestBackend>(&checkpoint, &store, &config, &device).unwrap();
    let modified = std::fs::metadata(&first).unwrap().modified().unwrap();
    let second = export_graph::<TestBackend>(&checkpoint, &store, &config, &device).unwrap();

    assert_eq!(first, second);
    assert_eq!(std::fs::metadata(&second).unwrap().modified().unwrap(), modified);
}

#[test]
fn fp16_engine_is_stored_next_to_fp32() {
    let run = tempfile::tempdir().unwrap();
    let checkpoint = save_checkpoint(&run.path().join("best"));
    let store = ArtifactStore::open(run.path().join("store")).unwrap();
    let device = Default::default();
    let config = ExportConfig::new();

    let fp32 = build_engine::<TestBackend>(
        &checkpoint,
        &store,
        &EngineBuildConfig::new(),
        &config,
        &device,
    )
    .unwrap();
    let fp16 = build_engine::<TestBackend>(
        &checkpoint,
        &store,
        &EngineBuildConfig::new().with_precision(Precision::Fp16),
        &config,
        &device,
    )
    .unwrap();

    assert_ne!(fp32, fp16);
    assert_eq!(Engine::read(&fp16).unwrap().header.precision, Precision::Fp16);
    assert!(std::fs::metadata(&fp16).unwrap().len() < std::fs::metadata(&fp32).unwrap().len());

    let graph_path = store.find_graph(checkpoint.content_hash()).unwrap();
    let image = sample_image();
    let predict = |artifact: ModelArtifact| {
        InferenceEngine::<TestBackend>::load(&artifact, device)
            .unwrap()
            .predict(&image, 0.5)
            .unwrap()
    };
    let graph = predict(ModelArtifact::Graph(graph_path));
    let half = predict(ModelArtifact::Engine(fp16.clone()));
    assert_eq!(half.backend, BackendKind::Engine);
    let disagreement = graph.mask_disagreement(&half);
    assert!(disagreement <= 0.01, "fp16 mask disagreement {disagreement}");

    // graph, fp32 engine, fp16 engine
    assert_eq!(store.list().len(), 3);
    assert_eq!(store.cleanup(Some(checkpoint.content_hash())).unwrap(), 3);
    assert!(store.list().is_empty());
}

#[test]
fn checkpoint_overwritten_after_open_is_not_exported() {
    let run = tempfile::tempdir().unwrap();
    let dir = run.path().join("best");
    let first = save_checkpoint(&dir);
    let second = save_checkpoint_with(&dir, tiny_model().with_head_prior_probability(0.2));
    assert_ne!(first.content_hash(), second.content_hash());

    let store = ArtifactStore::open(run.path().join("store")).unwrap();
    let device = Default::default();

    let result = export_graph::<TestBackend>(&first, &store, &ExportConfig::new(), &device);
    assert!(matches!(result, Err(StrokeSegError::ArtifactFormat { .. })));
    assert!(store.find_graph(first.content_hash()).is_none());

    let result = build_engine::<TestBackend>(
        &first,
        &store,
        &EngineBuildConfig::new(),
        &ExportConfig::new(),
        &device,
    );
    assert!(result.is_err());
    assert!(store.list().is_empty());

    let graph_path =
        export_graph::<TestBackend>(&second, &store, &ExportConfig::new(), &device).unwrap();
    let graph = Graph::read(&graph_path).unwrap();
    assert_eq!(graph.header.source_hash, second.content_hash());
}

#[test]
fn zero_workspace_fails_without_persisting() {
    let run = tempfile::tempdir().unwrap();
    let checkpoint = save_checkpoint(&run.path().join("best"));
    let store = ArtifactStore::open(run.path().join("store")).unwrap();
    let device = Default::default();

    let result = build_engine::<TestBackend>(
        &checkpoint,
        &store,
        &EngineBuildConfig::new().with_workspace_bytes(0),
        &ExportConfig::new(),
        &device,
    );

    assert!(matches!(result, Err(StrokeSegError::EngineBuildFailure { .. })));
    assert!(store
        .find_engine(checkpoint.content_hash(), Precision::Fp32)
        .is_none());
}

#[test]
fn leased_checkpoint_is_busy() {
    let run = tempfile::tempdir().unwrap();
    let checkpoint = save_checkpoint(&run.path().join("best"));
    let store = ArtifactStore::open(run.path().join("store")).unwrap();
    let device = Default::default();

    let lease = CheckpointLease::acquire(checkpoint.dir()).unwrap();
    let result = export_graph::<TestBackend>(&checkpoint, &store, &ExportConfig::new(), &device);
    assert!(matches!(result, Err(StrokeSegError::ArtifactBusy { .. })));

    drop(lease);
    assert!(export_graph::<TestBackend>(&checkpoint, &store, &ExportConfig::new(), &device).is_ok());
}
