#![allow(clippy::expect_used, clippy::unwrap_used)]

#[path = "../src/types/mod.rs"]
#[allow(dead_code)]
mod types;

#[test]
fn export_bindings() {
    let out_dir = tempfile::tempdir().expect("create temp dir");
    let out_path = out_dir.path().join("bindings.ts");
    let ts_cfg =
        specta::ts::ExportConfiguration::default().bigint(specta::ts::BigIntExportBehavior::Number);

    specta::export::ts_with_cfg(&out_path.to_string_lossy(), &ts_cfg)
        .expect("failed to export Specta bindings");

    let bindings = std::fs::read_to_string(&out_path).expect("read bindings");
    for name in [
        "WebhookDelivery",
        "WebhookResponse",
        "CircuitBreakerStats",
        "DeliveryStats",
    ] {
        assert!(
            bindings.contains(&format!("export type {name} ")),
            "missing binding for {name}"
        );
    }
}
