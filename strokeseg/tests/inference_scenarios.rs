mod common;

use common::TestBackend;
use image::DynamicImage;
use strokeseg::{
    build_engine, export_graph, ArtifactStore, BackendKind, Checkpoint, EngineBuildConfig,
    ExportConfig, InferenceEngine, ModelArtifact, ModelConfig, MonitoredMetric, PreprocessConfig,
};

#[test]
fn black_scan_yields_empty_mask_on_every_backend() {
    let run = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = ModelConfig::new();
    let model = config.init::<TestBackend>(&device).unwrap();
    let checkpoint = Checkpoint::save(
        &run.path().join("best"),
        &model,
        &config,
        &PreprocessConfig::new(),
        1,
        MonitoredMetric::Dice,
        0.0,
    )
    .unwrap();

    let store = ArtifactStore::open(run.path().join("store")).unwrap();
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

    let black = DynamicImage::new_rgb8(300, 200);
    let artifacts = [
        (BackendKind::Checkpoint, ModelArtifact::Checkpoint(checkpoint.dir().to_path_buf())),
        (BackendKind::Graph, ModelArtifact::Graph(graph_path)),
        (BackendKind::Engine, ModelArtifact::Engine(engine_path)),
    ];

    for (kind, artifact) in artifacts {
        let result = InferenceEngine::<TestBackend>::load(&artifact, device)
            .unwrap()
            .predict(&black, 0.5)
            .unwrap();

        assert_eq!(result.backend, kind);
        assert_eq!((result.height, result.width), (256, 256));
        assert_eq!(result.positive_pixels(), 0, "{kind}");
        assert!(result.binary_mask.iter().all(|&m| !m), "{kind}");
        assert_eq!(result.confidence, 0.0, "{kind}");
    }
}
