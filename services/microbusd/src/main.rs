//! microbusd: host many small service APIs in one process and expose
//! them over the configured sockets.

mod config;

use std::sync::Arc;

use mbus_core::{ApiBuilder, Runtime, Verb};
use mbus_data::{from_jsonc, from_stringz};
use mbus_evloop::EvError;
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

fn main() {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MICROBUSD_CONFIG").ok())
        .unwrap_or_else(|| "/etc/microbus/microbusd.toml".to_string());
    let cfg = match Config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log.filter.clone())),
        )
        .init();

    if let Err(e) = serve(&cfg) {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

fn serve(cfg: &Config) -> Result<(), String> {
    let runtime = Runtime::new().map_err(|e| e.to_string())?;

    register_binder_api(&runtime).map_err(|e| e.to_string())?;

    if let Some(basedir) = &cfg.binder.autoimport_dir {
        runtime
            .apis()
            .set_onlack(mbus_sock::autoset_resolver(&runtime, basedir));
        info!(basedir = %basedir, "auto-import enabled");
    }

    // Imports first: listeners may re-export imported APIs.
    let mut connections = Vec::new();
    for endpoint in &cfg.import {
        match mbus_sock::connect(&runtime, &endpoint.uri) {
            Ok(wrapper) => connections.push(wrapper),
            Err(e) => warn!(uri = %endpoint.uri, error = %e, "import failed"),
        }
    }

    let mut listeners = Vec::new();
    for endpoint in &cfg.listen {
        let listener = mbus_sock::Listener::bind(&runtime, &endpoint.uri)
            .map_err(|e| format!("cannot listen on {}: {e}", endpoint.uri))?;
        listeners.push(listener);
    }

    let _keepalive = runtime
        .evmgr()
        .add_timer(
            false,
            u64::from(cfg.binder.keepalive_secs),
            0,
            0,
            cfg.binder.keepalive_secs.saturating_mul(1000),
            100,
            |_timer, _decount| trace!("alive"),
            false,
        )
        .map_err(|e| e.to_string())?;

    info!(
        listeners = listeners.len(),
        imports = connections.len(),
        "microbusd up"
    );

    loop {
        match runtime.evmgr().run(-1) {
            Ok(_) | Err(EvError::Interrupted) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// The daemon's own introspection API.
fn register_binder_api(runtime: &Runtime) -> Result<(), mbus_core::CoreError> {
    let rt = runtime.clone();
    let api = ApiBuilder::new("binder")
        .info("microbusd introspection")
        .verb(Verb::new("ping", |req| {
            req.reply_ok(vec![from_stringz("pong")]);
        }))
        .verb(
            Verb::new("apis", move |req| {
                let names = rt.apis().names();
                req.reply_ok(vec![from_jsonc(serde_json::json!(names))]);
            })
            .with_info("list the registered api names"),
        )
        .verb(
            Verb::new("info", |req| {
                req.reply_ok(vec![from_jsonc(serde_json::json!({
                    "name": "microbusd",
                    "version": env!("CARGO_PKG_VERSION"),
                }))]);
            })
            .with_info("daemon identity"),
        )
        .build()?;
    runtime.register_api(api)
}
