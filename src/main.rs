use actix_server::ServerHandle;
use actix_web::{
    App, HttpServer,
    web::{self, Data},
};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use linky_console::{
    api::Api,
    config::{AppConfig, CertificateConfig},
    device_client::LinkyDeviceClient,
    services::validation::catalog::TestCatalog,
};
use log::{debug, error, info};
use rustls::crypto::{CryptoProvider, ring::default_provider};
use std::io::Write;
use tokio::signal::unix::{SignalKind, signal};

type UiApi = Api<LinkyDeviceClient>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize()?;

    let config = AppConfig::get().context("failed to load application configuration")?;

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let service_client =
        LinkyDeviceClient::new(config.device.base_url.clone(), config.device.request_timeout)
            .context("failed to create device client")?;

    info!("device at {}", config.device.base_url);

    let api = UiApi::new(
        service_client,
        TestCatalog::default(),
        config.validation.poll_interval,
    );

    let (server_handle, server_task) = run_server(config, api)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c received");
        },
        _ = sigterm.recv() => {
            debug!("SIGTERM received");
        },
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
    }

    info!("shutting down");
    server_handle.stop(true).await;
    info!("shutdown complete");

    Ok(())
}

fn initialize() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));

    CryptoProvider::install_default(default_provider())
        .map_err(|_| anyhow::anyhow!("crypto provider already installed"))?;

    Ok(())
}

fn run_server(
    config: &AppConfig,
    api: UiApi,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let address = format!("0.0.0.0:{}", config.ui.port);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api.clone()))
            .route("/config", web::post().to(UiApi::submit_config))
            .route("/config", web::get().to(UiApi::current_config))
            .route("/validation", web::get().to(UiApi::validation_status))
            .route(
                "/validation/restart",
                web::post().to(UiApi::restart_validation),
            )
            .route("/wifi-scan", web::get().to(UiApi::wifi_scan))
            .route("/reboot", web::post().to(UiApi::reboot))
            .route("/version", web::get().to(UiApi::version))
    });

    let server = match &config.certificate {
        Some(certificate) => {
            info!("serving https on {address}");
            server
                .bind_rustls_0_23(&address, load_tls_config(certificate)?)
                .context("failed to bind server")?
        }
        None => {
            info!("serving http on {address}");
            server.bind(&address).context("failed to bind server")?
        }
    };

    let server = server.disable_signals().run();

    Ok((server.handle(), tokio::spawn(server)))
}

fn load_tls_config(paths: &CertificateConfig) -> Result<rustls::ServerConfig> {
    let mut tls_certs = std::io::BufReader::new(
        std::fs::File::open(&paths.cert_path).context("failed to open certificate file")?,
    );

    let mut tls_key = std::io::BufReader::new(
        std::fs::File::open(&paths.key_path).context("failed to open key file")?,
    );

    let tls_certs = rustls_pemfile::certs(&mut tls_certs)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate pem")?;

    let key = rustls_pemfile::private_key(&mut tls_key)
        .context("failed to read key pem file")?
        .context("no valid key found in pem file")?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(tls_certs, key)
        .context("failed to create tls config")
}
