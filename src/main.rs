use std::env;

use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: wombat serve --config <path> | wombat verify-journal <path>";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();

    let result = match cmd.as_str() {
        "serve" => {
            let mut config_path = String::from("./config/example-config.yaml");
            while let Some(arg) = args.next() {
                if arg == "--config" {
                    if let Some(v) = args.next() {
                        config_path = v;
                    }
                }
            }
            serve(&config_path).await
        }
        "verify-journal" => match args.next() {
            Some(path) => wombat_server::verify_journal(&path).map(|summary| println!("{summary}")),
            None => Err("missing journal path".to_string()),
        },
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("wombat: {e}");
        std::process::exit(1);
    }
}

async fn serve(config_path: &str) -> Result<(), String> {
    let cfg = wombat_config::load_and_validate(config_path)
        .map_err(|e| format!("failed to load config: {e}"))?;

    // RUST_LOG wins over the configured filter.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.logging.filter))
        .map_err(|e| format!("invalid logging.filter: {e}"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(config = config_path, "starting wombat");
    wombat_server::serve(cfg).await
}
