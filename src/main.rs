use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use fsal::backend::local::LocalConnector;
use fsal::backend::memory::{ClusterConfig, ClusterConnector};
use fsal::backend::IoMode;
use fsal::config::{Cli, Command, ExportConfig, Identity, MountParams, PnfsConfig};
use fsal::pnfs::device::decode_device_addr;
use fsal::pnfs::layout::decode_file_layout;
use fsal::pnfs::{LayoutGetArgs, LayoutReturnArgs, LayoutType, Segment};
use fsal::{Export, MountRegistry};

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let log_dir = cli
        .log_file
        .parent()
        .unwrap_or_else(|| std::path::Path::new("/tmp"));
    let log_name = cli
        .log_file
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("fsal.log"));
    let file_appender = tracing_appender::rolling::never(log_dir, log_name);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        );
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let outcome = match cli.command {
        Command::Handle {
            root,
            path,
            export_id,
        } => show_handle(root, &path, export_id),
        Command::Layout {
            nodes,
            stripe_unit,
            offset,
            length,
            min_length,
            mode,
        } => show_layout(nodes, stripe_unit, offset, length, min_length, mode.into()),
    };

    match outcome {
        Ok(report) => println!("{}", report),
        Err(e) => {
            error!("{}", e);
            eprintln!("fsal: {} ({})", e, e.status());
            std::process::exit(1);
        }
    }
}

fn show_handle(root: std::path::PathBuf, path: &str, export_id: u16) -> fsal::Result<String> {
    let root = std::fs::canonicalize(&root).unwrap_or_else(|e| {
        eprintln!("Error: export directory {:?}: {}", root, e);
        std::process::exit(1);
    });
    let registry = Arc::new(MountRegistry::new(Arc::new(LocalConnector)));
    let config = ExportConfig {
        export_id,
        mount: MountParams::local(root.to_string_lossy()),
        sub_path: "/".to_string(),
        identity: Identity::default(),
        pnfs: PnfsConfig::default(),
    };
    let export = Export::create(&registry, &config, None)?;
    info!("export {} serving {}", export_id, root.display());

    let report = {
        let handle = export.lookup_path(path)?;
        let attrs = handle.getattr()?;
        let key = handle.handle_to_key();
        json!({
            "path": path,
            "wire": key.hex(),
            "key": key,
            "kind": attrs.kind,
            "size": attrs.size,
            "root": handle.is_root(),
        })
    };
    export.destroy();
    Ok(serde_json::to_string_pretty(&report).unwrap_or_default())
}

fn show_layout(
    nodes: u32,
    stripe_unit: u32,
    offset: u64,
    length: u64,
    min_length: u64,
    mode: IoMode,
) -> fsal::Result<String> {
    let cluster = ClusterConfig {
        stripe_unit,
        object_size: stripe_unit,
        ..ClusterConfig::with_nodes(nodes)
    };
    let connector = Arc::new(ClusterConnector::new(cluster));
    let registry = Arc::new(MountRegistry::new(connector.clone()));
    let config = ExportConfig {
        export_id: 1,
        mount: MountParams::cluster("simulated"),
        sub_path: "/".to_string(),
        identity: Identity::default(),
        pnfs: PnfsConfig::default(),
    };
    let (recall_tx, _recall_rx) = fsal::recall::channel();
    let export = Export::create(&registry, &config, Some(recall_tx))?;
    if let Some(cluster) = connector.latest() {
        cluster.seed_file("/data/file", b"layout sample")?;
    }

    let report = {
        let file = export.lookup_path("/data/file")?;
        let grant = file.layoutget(&LayoutGetArgs {
            layout_type: LayoutType::Files.to_wire(),
            segment: Segment::new(mode, offset, length),
            min_length,
        })?;
        let body = decode_file_layout(&grant.body)?;
        let info = export.getdeviceinfo(LayoutType::Files.to_wire(), &grant.device_id)?;
        let addr = decode_device_addr(&info)?;
        let mut per_node = vec![0u32; addr.multipath.len()];
        for &node in &addr.stripe_indices {
            if let Some(count) = per_node.get_mut(node as usize) {
                *count += 1;
            }
        }
        file.layoutreturn(&LayoutReturnArgs {
            layout_type: LayoutType::Files.to_wire(),
            segment: grant.segment,
            dispose: true,
        })?;
        json!({
            "grant": grant,
            "stripe_unit": body.stripe_unit(),
            "body_len": grant.body.len(),
            "device_info_len": info.len(),
            "stripes_per_node": per_node,
            "nodes": addr.multipath,
        })
    };
    export.destroy();
    Ok(serde_json::to_string_pretty(&report).unwrap_or_default())
}
