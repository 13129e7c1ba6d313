use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telemetry_export::config::{LogFormat, ServiceConfig, StorageBackend, StorageConfig};
use telemetry_export::source::projects;
use telemetry_export::{
    AccessToken, BlobStore, Config, Exporter, GoogleCloudClient, Importer, MemoryBlobStore,
    Project, S3BlobStore, TarGzCodec,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the projects the service account can see
    ListProjects {
        /// OAuth2 access token file for the Google Cloud APIs
        #[clap(long)]
        service_account: PathBuf,
    },
    /// Export the metrics of one or more projects
    Export {
        /// Company name, used in bucket names
        #[clap(long)]
        company: String,
        /// Comma-separated project ids
        #[clap(long, value_delimiter = ',', required = true)]
        projects: Vec<String>,
        /// OAuth2 access token file for the Google Cloud APIs
        #[clap(long)]
        service_account: PathBuf,
        /// Shared-credentials file for the blob store
        #[clap(long)]
        storage_credentials: PathBuf,
        /// Continue with the remaining projects after a failure
        #[clap(long)]
        keep_going: bool,
    },
    /// Extract every archive of a bucket into a directory
    Import {
        #[clap(long)]
        bucket: String,
        #[clap(long)]
        target_dir: PathBuf,
        /// Shared-credentials file for the blob store
        #[clap(long)]
        storage_credentials: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service);

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    info!(service = %config.service.name, "Starting telemetry export");

    match args.command {
        Command::ListProjects { service_account } => list_projects(&config, &service_account).await,
        Command::Export {
            company,
            projects,
            service_account,
            storage_credentials,
            keep_going,
        } => {
            export(
                &config,
                &company,
                &projects,
                &service_account,
                &storage_credentials,
                keep_going,
            )
            .await
        }
        Command::Import {
            bucket,
            target_dir,
            storage_credentials,
        } => import(&config, &bucket, &target_dir, &storage_credentials).await,
    }
}

async fn list_projects(config: &Config, service_account: &Path) -> Result<()> {
    let token = AccessToken::from_file(service_account)
        .context("Failed to read service account credentials")?;
    let client = GoogleCloudClient::new(&config.gcp, token)?;

    let listed: Vec<Project> = projects(&client)
        .try_collect()
        .await
        .context("Failed to list projects")?;

    for project in &listed {
        println!("{}\t{}", project.project_id, project.name);
    }
    info!(projects = listed.len(), "Listed projects");
    Ok(())
}

async fn export(
    config: &Config,
    company: &str,
    projects: &[String],
    service_account: &Path,
    storage_credentials: &Path,
    keep_going: bool,
) -> Result<()> {
    let token = AccessToken::from_file(service_account)
        .context("Failed to read service account credentials")?;
    let store = build_store(&config.storage, storage_credentials).await?;
    let client = Arc::new(GoogleCloudClient::new(&config.gcp, token)?);

    let exporter = Exporter::new(
        client.clone(),
        client,
        store,
        Arc::new(TarGzCodec::new()),
        config.export.clone(),
    );

    let mut failed = Vec::new();
    for project in projects {
        match exporter.export_project(company, project).await {
            Ok(summary) => info!(
                project = %project,
                bucket = %summary.bucket,
                records = summary.records,
                objects = summary.objects.len(),
                "Project exported"
            ),
            Err(e) if keep_going => {
                error!(project = %project, error = %e, "Project export failed");
                failed.push(project.as_str());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to export project {project}")),
        }
    }

    if !failed.is_empty() {
        bail!(
            "Export failed for {} of {} projects: {}",
            failed.len(),
            projects.len(),
            failed.join(", ")
        );
    }
    Ok(())
}

async fn import(
    config: &Config,
    bucket: &str,
    target_dir: &Path,
    storage_credentials: &Path,
) -> Result<()> {
    let store = build_store(&config.storage, storage_credentials).await?;
    let importer = Importer::new(store, Arc::new(TarGzCodec::new()));

    let summary = importer
        .import_bucket(bucket, target_dir)
        .await
        .with_context(|| format!("Failed to import bucket {bucket}"))?;

    info!(bucket = %bucket, extracted = summary.extracted, "Bucket imported");
    Ok(())
}

async fn build_store(config: &StorageConfig, credentials: &Path) -> Result<Arc<dyn BlobStore>> {
    match config.backend {
        StorageBackend::S3 => {
            if !credentials.is_file() {
                bail!(
                    "Storage credentials file {} does not exist",
                    credentials.display()
                );
            }
            Ok(Arc::new(S3BlobStore::new(config, Some(credentials)).await))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory blob store, nothing will be persisted");
            Ok(Arc::new(MemoryBlobStore::new()))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    // stdout is reserved for command output
    match service.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
