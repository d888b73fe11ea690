//! Instance Notifier (§4.D): an in-process pub/sub bus broadcasting each stored instance.
//!
//! Observers subscribe once at startup. Delivery is synchronous, in subscription order; an
//! observer error is isolated (logged) and never aborts the publisher or other observers. Per the
//! "pub/sub over observers" design note (§9), observers must not perform long I/O inline — the
//! Grouping Engine observer only enqueues onto its own bounded channel.

use crate::types::Instance;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ObserverError {
	#[error("observer channel is closed")]
	ChannelClosed,
}

/// An observer of stored-instance events. Implementations must return quickly; the notifier
/// awaits each observer in turn before moving to the next.
pub trait Observer: Send + Sync {
	fn notify(
		&self,
		instance: &Instance,
	) -> impl std::future::Future<Output = Result<(), ObserverError>> + Send;
}

pub struct Notifier {
	observers: Vec<Arc<dyn ObserverDyn>>,
}

/// Object-safe wrapper so heterogeneous observer implementations can be stored behind `dyn`.
#[async_trait::async_trait]
trait ObserverDyn: Send + Sync {
	async fn notify(&self, instance: &Instance) -> Result<(), ObserverError>;
}

#[async_trait::async_trait]
impl<T: Observer + Send + Sync> ObserverDyn for T {
	async fn notify(&self, instance: &Instance) -> Result<(), ObserverError> {
		Observer::notify(self, instance).await
	}
}

impl Notifier {
	pub fn new() -> Self {
		Self {
			observers: Vec::new(),
		}
	}

	/// Registers an observer. Intended to happen once, at startup, before any instances flow.
	pub fn subscribe<O: Observer + 'static>(&mut self, observer: O) {
		self.observers.push(Arc::new(observer));
	}

	/// Publishes an instance to every observer, in subscription order, on the caller's task.
	/// Per-association ordering is preserved because the Association Handler calls this
	/// synchronously, once per stored instance, before sending the C-STORE-RSP (§4.C step 6).
	pub async fn publish(&self, instance: &Instance) {
		for observer in &self.observers {
			if let Err(err) = observer.notify(instance).await {
				error!(
					sop_instance_uid = instance.sop_instance_uid,
					"Notifier observer failed: {err}"
				);
			}
		}
	}
}

impl Default for Notifier {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc as StdArc;

	fn sample_instance(sop_instance_uid: &str) -> Instance {
		Instance {
			sop_instance_uid: sop_instance_uid.to_string(),
			series_instance_uid: String::from("1.2.3.4"),
			study_instance_uid: String::from("1.2.3"),
			patient_id: String::from("P1"),
			called_ae: String::from("CLARA1"),
			calling_ae: String::from("PACS1"),
			received_at: chrono::Utc::now(),
			file_path: std::path::PathBuf::from("/tmp/x.dcm"),
			transfer_syntax: String::from("1.2.840.10008.1.2.1"),
		}
	}

	struct CountingObserver {
		count: StdArc<AtomicUsize>,
		order: StdArc<std::sync::Mutex<Vec<u8>>>,
		tag: u8,
		fail: bool,
	}

	impl Observer for CountingObserver {
		async fn notify(&self, _instance: &Instance) -> Result<(), ObserverError> {
			self.count.fetch_add(1, Ordering::SeqCst);
			self.order.lock().unwrap().push(self.tag);
			if self.fail {
				return Err(ObserverError::ChannelClosed);
			}
			Ok(())
		}
	}

	#[tokio::test]
	async fn delivers_to_all_observers_in_subscription_order() {
		let count = StdArc::new(AtomicUsize::new(0));
		let order = StdArc::new(std::sync::Mutex::new(Vec::new()));
		let mut notifier = Notifier::new();
		notifier.subscribe(CountingObserver {
			count: count.clone(),
			order: order.clone(),
			tag: 1,
			fail: false,
		});
		notifier.subscribe(CountingObserver {
			count: count.clone(),
			order: order.clone(),
			tag: 2,
			fail: false,
		});

		notifier.publish(&sample_instance("1")).await;

		assert_eq!(count.load(Ordering::SeqCst), 2);
		assert_eq!(*order.lock().unwrap(), vec![1, 2]);
	}

	#[tokio::test]
	async fn failing_observer_does_not_block_others() {
		let count = StdArc::new(AtomicUsize::new(0));
		let order = StdArc::new(std::sync::Mutex::new(Vec::new()));
		let mut notifier = Notifier::new();
		notifier.subscribe(CountingObserver {
			count: count.clone(),
			order: order.clone(),
			tag: 1,
			fail: true,
		});
		notifier.subscribe(CountingObserver {
			count: count.clone(),
			order: order.clone(),
			tag: 2,
			fail: false,
		});

		notifier.publish(&sample_instance("1")).await;

		assert_eq!(count.load(Ordering::SeqCst), 2);
	}
}
