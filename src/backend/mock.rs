//! Scripted in-memory [`NetworkService`] used by the workflow tests.

use crate::backend::dimse::association::{AssociationError, ChannelError};
use crate::backend::{
	FindMatch, NetworkService, PresentationParameter, RemotePeer, ServiceError, Session,
	StoreInstance, STATUS_SUCCESS,
};
use crate::types::{UI, US};
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// A primitive observed by the mock peer.
#[derive(Debug, Clone)]
pub enum Primitive {
	Find {
		sop_class_uid: UI,
		identifier: InMemDicomObject,
	},
	Create {
		sop_class_uid: UI,
		sop_instance_uid: UI,
		data_set: InMemDicomObject,
	},
	Set {
		sop_class_uid: UI,
		sop_instance_uid: UI,
		data_set: InMemDicomObject,
	},
	Store(StoreInstance),
}

/// The kinds of primitives a session can be scripted to fail on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
	Find,
	Create,
	Set,
	Store,
}

#[derive(Debug, Default)]
struct State {
	opened: Vec<(RemotePeer, PresentationParameter)>,
	released: usize,
	primitives: Vec<Primitive>,
	find_results: VecDeque<Vec<FindMatch>>,
	refuse_associations: bool,
	normalized_status: Option<US>,
	store_statuses: VecDeque<US>,
	failures: Vec<(Operation, usize)>,
	calls: HashMap<Operation, usize>,
}

impl State {
	/// Counts a call of `operation` and fails it if it was scripted to fail.
	fn exchange(&mut self, operation: Operation) -> Result<(), ServiceError> {
		let count = self.calls.entry(operation).or_default();
		*count += 1;
		let nth = *count;
		if self.failures.contains(&(operation, nth)) {
			return Err(ServiceError::Association(AssociationError::Channel(
				ChannelError::Closed,
			)));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
	state: Arc<Mutex<State>>,
}

impl MockNetwork {
	pub fn new() -> Self {
		Self::default()
	}

	/// Queues the identifiers returned by the next C-FIND, each in a pending response.
	pub fn push_find_result(&self, identifiers: Vec<InMemDicomObject>) {
		self.push_find_responses(
			identifiers
				.into_iter()
				.map(|identifier| FindMatch {
					status: 0xFF00,
					identifier,
				})
				.collect(),
		);
	}

	/// Queues the responses of the next C-FIND verbatim.
	pub fn push_find_responses(&self, responses: Vec<FindMatch>) {
		self.state.lock().unwrap().find_results.push_back(responses);
	}

	pub fn refuse_associations(&self) {
		self.state.lock().unwrap().refuse_associations = true;
	}

	/// Status answered to every N-CREATE and N-SET.
	pub fn answer_normalized(&self, status: US) {
		self.state.lock().unwrap().normalized_status = Some(status);
	}

	/// Statuses answered to the next C-STOREs, in order. Once exhausted, stores succeed.
	pub fn answer_stores(&self, statuses: impl IntoIterator<Item = US>) {
		self.state.lock().unwrap().store_statuses.extend(statuses);
	}

	/// Drops the connection during the `nth` call (counted from 1) of `operation`. The primitive
	/// is still recorded as sent.
	pub fn fail_on(&self, operation: Operation, nth: usize) {
		self.state.lock().unwrap().failures.push((operation, nth));
	}

	pub fn opened(&self) -> Vec<(RemotePeer, PresentationParameter)> {
		self.state.lock().unwrap().opened.clone()
	}

	pub fn released(&self) -> usize {
		self.state.lock().unwrap().released
	}

	pub fn primitives(&self) -> Vec<Primitive> {
		self.state.lock().unwrap().primitives.clone()
	}

	pub fn stored(&self) -> Vec<StoreInstance> {
		self.primitives()
			.into_iter()
			.filter_map(|primitive| match primitive {
				Primitive::Store(instance) => Some(instance),
				_ => None,
			})
			.collect()
	}
}

#[async_trait]
impl NetworkService for MockNetwork {
	async fn associate(
		&self,
		peer: &RemotePeer,
		presentation: PresentationParameter,
	) -> Result<Box<dyn Session>, AssociationError> {
		let mut state = self.state.lock().unwrap();
		if state.refuse_associations {
			return Err(AssociationError::Channel(ChannelError::Closed));
		}
		state.opened.push((peer.clone(), presentation));
		Ok(Box::new(MockSession {
			state: Arc::clone(&self.state),
		}))
	}
}

struct MockSession {
	state: Arc<Mutex<State>>,
}

#[async_trait]
impl Session for MockSession {
	async fn find(
		&mut self,
		sop_class_uid: &str,
		identifier: InMemDicomObject,
	) -> Result<Vec<FindMatch>, ServiceError> {
		let mut state = self.state.lock().unwrap();
		state.primitives.push(Primitive::Find {
			sop_class_uid: UI::from(sop_class_uid),
			identifier,
		});
		state.exchange(Operation::Find)?;
		Ok(state.find_results.pop_front().unwrap_or_default())
	}

	async fn create(
		&mut self,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		data_set: InMemDicomObject,
	) -> Result<US, ServiceError> {
		let mut state = self.state.lock().unwrap();
		state.primitives.push(Primitive::Create {
			sop_class_uid: UI::from(sop_class_uid),
			sop_instance_uid: UI::from(sop_instance_uid),
			data_set,
		});
		state.exchange(Operation::Create)?;
		Ok(state.normalized_status.unwrap_or(STATUS_SUCCESS))
	}

	async fn set(
		&mut self,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		data_set: InMemDicomObject,
	) -> Result<US, ServiceError> {
		let mut state = self.state.lock().unwrap();
		state.primitives.push(Primitive::Set {
			sop_class_uid: UI::from(sop_class_uid),
			sop_instance_uid: UI::from(sop_instance_uid),
			data_set,
		});
		state.exchange(Operation::Set)?;
		Ok(state.normalized_status.unwrap_or(STATUS_SUCCESS))
	}

	async fn store(&mut self, instance: StoreInstance) -> Result<US, ServiceError> {
		let mut state = self.state.lock().unwrap();
		state.primitives.push(Primitive::Store(instance));
		state.exchange(Operation::Store)?;
		Ok(state.store_statuses.pop_front().unwrap_or(STATUS_SUCCESS))
	}

	async fn release(self: Box<Self>) {
		self.state.lock().unwrap().released += 1;
	}
}
