mod api;
mod config;
mod dimse;
mod error;
mod grouping;
mod kv;
mod notifier;
mod platform;
mod registry;
mod retrieval;
mod staging;
mod store;
mod submitter;
mod types;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::dimse::association::pool::AssociationPools;
use crate::dimse::cmove::MoveMediator;
use crate::dimse::StoreServiceClassProvider;
use crate::grouping::{GroupingEngine, GroupingObserver};
use crate::kv::RedbKvStore;
use crate::notifier::Notifier;
use crate::platform::HttpPlatformClient;
use crate::registry::Registry;
use crate::retrieval::{DicomWebRetrievalClient, DimseRetrievalClient};
use crate::staging::StagingStore;
use crate::store::InferenceRequestStore;
use crate::submitter::Submitter;
use crate::worker::{CancellationRegistry, CompositeRetriever, WorkerPool};

/// The AE title this adapter presents when no `server.aet` is configured.
pub const DEFAULT_AET: &str = "DICOM_ADAPTER";

#[derive(Clone)]
pub struct AppState {
	store: Arc<InferenceRequestStore<RedbKvStore>>,
	cancellations: CancellationRegistry,
}

fn init_logger(level: tracing::Level) -> Result<(), anyhow::Error> {
	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(level.into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level)?;
	debug!("Config: {config:?}");

	let registry = Arc::new(Registry::new(&config));
	let staging = Arc::new(StagingStore::new(config.staging.clone()));

	let kv = RedbKvStore::open(&config.kv.path)?;
	let store = Arc::new(InferenceRequestStore::new(kv));
	let recovered = store.recover_in_process()?;
	if recovered > 0 {
		info!(recovered, "Recovered in-process inference requests as Queued after restart");
	}

	let platform_client = HttpPlatformClient::new(
		url::Url::parse(&config.platform.base_url)?,
		Duration::from_millis(config.platform.timeout_ms),
	)?;
	let submitter = Arc::new(Submitter::new(platform_client, config.platform.max_job_name_len));

	let grouping_engine = Arc::new(GroupingEngine::new(Arc::clone(&submitter)));

	let mut notifier = Notifier::new();
	for called_aet in &config.called_aets {
		notifier.subscribe(GroupingObserver::<HttpPlatformClient>::new(
			Arc::clone(&grouping_engine),
			Arc::new(called_aet.clone()),
		));
	}
	let notifier = Arc::new(notifier);

	let mediator = Arc::new(MoveMediator::new());
	let pools = AssociationPools::new(&config);

	let dimse_retrieval = DimseRetrievalClient::new(
		pools,
		Arc::clone(&mediator),
		&config.retrieval,
		config.server.aet.clone(),
		Duration::from_millis(config.server.dimse.dimse_timeout_ms),
		Duration::from_millis(config.worker.retrieval_timeout_ms),
	);
	let dicomweb_retrieval =
		DicomWebRetrievalClient::new(Duration::from_millis(config.worker.retrieval_timeout_ms))?;
	let retriever = Arc::new(CompositeRetriever {
		dimse: Some(dimse_retrieval),
		dicomweb: Some(dicomweb_retrieval),
	});

	let worker_pool = Arc::new(WorkerPool::new(
		Arc::clone(&store),
		Arc::clone(&staging),
		Arc::clone(&submitter),
		retriever,
		config.worker.clone(),
	));
	let cancellations = worker_pool.cancellations();
	worker_pool.spawn();

	let scp = StoreServiceClassProvider::new(
		config.server.aet.clone(),
		config.server.dimse.clone(),
		config.server.max_associations,
		Arc::clone(&registry),
		Arc::clone(&staging),
		Arc::clone(&notifier),
		Arc::clone(&mediator),
		config.retrieval.move_destination_aet.clone(),
	);
	tokio::spawn(async move {
		if let Err(err) = scp.spawn().await {
			tracing::error!("Association Handler stopped: {err}");
		}
	});

	let reaper_staging = Arc::clone(&staging);
	let reap_interval = Duration::from_secs(3600);
	tokio::spawn(async move {
		loop {
			tokio::time::sleep(reap_interval).await;
			if let Err(err) = reaper_staging.reap_expired().await {
				tracing::warn!("Staging reap failed: {err}");
			}
		}
	});

	let state = AppState { store, cancellations };
	let app: Router = api::routes(&config.server.http.base_path)
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.layer(TimeoutLayer::new(Duration::from_millis(
			config.server.http.request_timeout_ms,
		)))
		.with_state(state);

	let address = SocketAddr::from((config.server.http.interface, config.server.http.port));
	let listener = TcpListener::bind(&address).await?;
	info!("Starting HTTP server on http://{address}");
	axum::serve(listener, app).await?;

	Ok(())
}
