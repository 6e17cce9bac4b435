use std::path::PathBuf;

#[path = "src/types/mod.rs"]
mod types;

fn main() {
    println!("cargo:rerun-if-env-changed=COURIER_BINDINGS_DIR");

    let out_dir = match std::env::var("COURIER_BINDINGS_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => PathBuf::from("../console/src/generated"),
    };

    if !out_dir.is_dir() {
        println!(
            "cargo:warning=Specta bindings output dir not found; skipping generation: {}",
            out_dir.display()
        );
        return;
    }

    let out_file = out_dir.join("bindings.ts");
    let out_file_str = out_file.to_string_lossy().into_owned();
    let ts_cfg =
        specta::ts::ExportConfiguration::default().bigint(specta::ts::BigIntExportBehavior::Number);
    match specta::export::ts_with_cfg(&out_file_str, &ts_cfg) {
        Ok(()) => {}
        Err(specta::ts::TsExportError::Io(io_err))
            if io_err.kind() == std::io::ErrorKind::PermissionDenied =>
        {
            println!(
                "cargo:warning=Specta bindings output not writable; skipping generation: {}",
                out_file.display()
            );
        }
        Err(err) => {
            println!(
                "cargo:warning=failed to export Specta bindings to {}: {err}",
                out_file.display()
            );
            std::process::exit(1);
        }
    }

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/types/mod.rs");
    println!("cargo:rerun-if-changed=src/types/webhook.rs");
    println!("cargo:rerun-if-changed=src/types/webhook_delivery.rs");
    println!("cargo:rerun-if-changed=src/types/delivery_attempt_log.rs");
    println!("cargo:rerun-if-changed=src/types/circuit_breaker.rs");
    println!("cargo:rerun-if-changed=src/types/stats.rs");
    println!("cargo:rerun-if-changed=src/types/admin.rs");
    println!("cargo:rerun-if-changed=src/types/api_error.rs");
}
