use crate::dimse::association;
use crate::dimse::EchoServiceClassUser;
use crate::config::AppConfig;
use crate::types::UI;
use association::client::{ClientAssociation, ClientAssociationOptions};
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;

use futures::TryFutureExt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolError<T> {
	#[error(transparent)]
	Backend(#[from] T),
	#[error("Timed out")]
	Timeout,
	#[error("Failed to recycle object: {0}")]
	Recycle(String),
	#[error("Failed to resolve address: {0}")]
	Resolve(#[source] std::io::Error),
}

pub trait Manager: Send + Sync {
	type Object;
	type Error;
	type Parameter: PartialEq;

	async fn create(&self, param: &Self::Parameter)
		-> Result<Self::Object, PoolError<Self::Error>>;
	async fn recycle(&self, object: &Self::Object) -> Result<(), String>;
}

pub struct Pool<M: Manager> {
	inner: Arc<InnerPool<M>>,
}

impl<M: Manager> Pool<M> {
	pub fn new(manager: M, pool_size: usize, timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				manager,
				slots: Mutex::new(VecDeque::new()),
				semaphore: Semaphore::new(pool_size),
				timeout,
			}),
		}
	}

	pub async fn get(&self, parameter: M::Parameter) -> Result<Object<M>, PoolError<M::Error>> {
		let timeout = tokio::time::timeout(self.inner.timeout, async {
			self.inner
				.semaphore
				.acquire()
				.await
				.expect("Semaphore should not be closed")
				.forget();

			let slot: Option<ObjectInner<M>> = {
				let mut slots = self.inner.slots.lock().unwrap();
				let target_slot = slots
					.iter()
					.rposition(|slot| slot.parameter == parameter)
					.and_then(|position| slots.remove(position));

				if let Some(target_slot) = target_slot {
					Some(target_slot)
				} else {
					slots.pop_front();
					None
				}
			};

			let object_inner = if let Some(mut slot) = slot {
				let obj = {
					let recycle_result = self.inner.manager.recycle(&slot.object).await;
					if recycle_result.is_ok() {
						slot.metrics.recycle_count += 1;
						slot.metrics.last_used = Instant::now();
						slot
					} else {
						let object = self.inner.manager.create(&parameter).await?;
						let now = Instant::now();
						ObjectInner {
							object,
							parameter,
							metrics: Metrics {
								recycle_count: 0,
								created: now,
								last_used: now,
							},
						}
					}
				};

				obj
			} else {
				let object = self.inner.manager.create(&parameter).await?;
				let now = Instant::now();

				ObjectInner {
					object,
					parameter,
					metrics: Metrics {
						recycle_count: 0,
						created: now,
						last_used: now,
					},
				}
			};

			Ok(Object {
				pool: Arc::downgrade(&self.inner),
				inner: Some(object_inner),
			})
		});

		timeout.unwrap_or_else(|_| Err(PoolError::Timeout)).await
	}
}

pub struct Object<M: Manager> {
	pool: Weak<InnerPool<M>>,
	inner: Option<ObjectInner<M>>,
}

impl<M: Manager> Deref for Object<M> {
	type Target = M::Object;

	fn deref(&self) -> &Self::Target {
		&self.inner.as_ref().unwrap().object
	}
}

impl<M: Manager> Drop for Object<M> {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.upgrade() {
			pool.semaphore.add_permits(1);
			if let Some(object) = self.inner.take() {
				let mut slots = pool.slots.lock().unwrap();
				slots.push_back(object);
			}
		}
	}
}

impl<M: Manager> Clone for Pool<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

struct InnerPool<M: Manager> {
	manager: M,
	slots: Mutex<VecDeque<ObjectInner<M>>>,
	semaphore: Semaphore,
	timeout: Duration,
}

struct ObjectInner<M: Manager> {
	object: M::Object,
	parameter: M::Parameter,
	metrics: Metrics,
}

#[derive(Debug)]
pub struct Metrics {
	pub created: Instant,
	pub recycle_count: usize,
	pub last_used: Instant,
}

pub struct AssociationManager {
	/// Hostname or IP literal; resolved on each [`Manager::create`] since a configured DIMSE
	/// source may be a hostname rather than a literal address.
	pub host: String,
	pub port: u16,
	pub calling_aet: String,
	pub called_aet: String,
}

impl AssociationManager {
	async fn resolve(&self) -> Result<std::net::SocketAddr, std::io::Error> {
		tokio::net::lookup_host((self.host.as_str(), self.port))
			.await?
			.next()
			.ok_or_else(|| {
				std::io::Error::new(
					std::io::ErrorKind::NotFound,
					format!("could not resolve {}:{}", self.host, self.port),
				)
			})
	}
}

pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

impl PartialEq for PresentationParameter {
	fn eq(&self, other: &Self) -> bool {
		self.abstract_syntax_uid == other.abstract_syntax_uid
			&& self
				.transfer_syntax_uids
				.iter()
				.any(|ts| other.transfer_syntax_uids.contains(ts))
	}
}

impl Manager for AssociationManager {
	type Object = ClientAssociation;
	type Error = association::AssociationError;
	type Parameter = PresentationParameter;

	async fn create(
		&self,
		param: &Self::Parameter,
	) -> Result<Self::Object, PoolError<Self::Error>> {
		let address = self.resolve().await.map_err(PoolError::Resolve)?;
		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			abstract_syntax: param.abstract_syntax_uid.clone(),
			transfer_syntaxes: param.transfer_syntax_uids.clone(),
			address,
		};

		let association = ClientAssociation::new(options)
			.await
			.map_err(PoolError::Backend);

		if let Ok(association) = &association {
			info!(
				backend_uuid = association.uuid().to_string(),
				"Created new client association"
			);
		} else {
			warn!("Failed to create new client association");
		}

		association
	}

	async fn recycle(&self, association: &Self::Object) -> Result<(), String> {
		let successful = EchoServiceClassUser::new(association)
			.echo(Duration::from_secs(5))
			.await
			.map_err(|err| format!("Failed to recycle association: {err}"))?;

		if successful {
			info!(
				backend_uuid = association.uuid().to_string(),
				"Recycled association"
			);
			Ok(())
		} else {
			warn!(
				backend_uuid = association.uuid().to_string(),
				"Recycling failed"
			);
			Err(String::from("C-ECHO returned non-successful status code"))
		}
	}
}

pub type AssociationPool = Pool<AssociationManager>;

/// One [`AssociationPool`] per configured DIMSE retrieval source (§4.I), keyed by `source_id`
/// rather than called AE title — a single source may be queried for many different called AEs'
/// inference requests.
#[derive(Clone)]
pub struct AssociationPools(HashMap<String, AssociationPool>);

impl AssociationPools {
	pub fn new(config: &AppConfig) -> Self {
		let mut pools = HashMap::with_capacity(config.retrieval.dimse_sources.len());
		for source in &config.retrieval.dimse_sources {
			let pool_size = source.pool.size;
			let mgr = AssociationManager {
				calling_aet: config.server.aet.clone(),
				host: source.host.clone(),
				port: source.port,
				called_aet: source.called_aet.clone(),
			};

			let pool = Pool::new(
				mgr,
				source.pool.size,
				Duration::from_millis(source.pool.timeout_ms),
			);
			pools.insert(source.source_id.clone(), pool);

			info!(
				source_id = source.source_id,
				pool_size, "Created new association pool"
			);
		}

		Self(pools)
	}

	#[inline]
	pub fn get(&self, source_id: &str) -> Option<&AssociationPool> {
		self.0.get(source_id)
	}

	#[inline]
	pub fn source_ids(&self) -> impl Iterator<Item = &String> {
		self.0.keys()
	}
}
