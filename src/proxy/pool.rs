use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::route::WorkerSettings;

enum Job<T> {
	Item(T),
	Sentinel,
}

struct State<T> {
	queue: VecDeque<Job<T>>,
	total: usize,
	idle: usize,
	shutdown: bool,
}

struct Shared<T> {
	state: Mutex<State<T>>,
	/// Signals "job available" (and, during drain, "a worker exited").
	available: Condvar,
	/// Signals "queue has room".
	space: Condvar,
	settings: WorkerSettings,
	handler: Box<dyn Fn(T) + Send + Sync>,
}

/// Bounded elastic worker pool over a FIFO accept queue. Holds at least
/// `min` workers; spawns up to `max` when every worker is busy; workers
/// above the minimum exit after `idle_timeout` without work. Enqueueing
/// blocks when the queue is full, so overflow cannot drop connections.
pub struct WorkerPool<T: Send + 'static> {
	shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
	pub fn new(
		settings: WorkerSettings,
		handler: impl Fn(T) + Send + Sync + 'static,
	) -> WorkerPool<T> {
		let shared = Arc::new(Shared {
			state: Mutex::new(State {
				queue: VecDeque::new(),
				total: 0,
				idle: 0,
				shutdown: false,
			}),
			available: Condvar::new(),
			space: Condvar::new(),
			settings,
			handler: Box::new(handler),
		});
		{
			let mut st = shared.state.lock().expect("pool state poisoned");
			for _ in 0..shared.settings.min {
				spawn_worker(&shared, &mut st);
			}
		}
		WorkerPool { shared }
	}

	/// Enqueue one work item. Returns false once shutdown has begun.
	pub fn submit(&self, item: T) -> bool {
		let shared = &self.shared;
		let mut st = shared.state.lock().expect("pool state poisoned");
		loop {
			if st.shutdown {
				return false;
			}
			// everyone is busy: grow before (possibly) blocking
			if st.idle == 0 && st.total < shared.settings.max {
				spawn_worker(shared, &mut st);
			}
			if st.queue.len() < shared.settings.queue {
				break;
			}
			st = shared.space.wait(st).expect("pool state poisoned");
		}
		st.queue.push_back(Job::Item(item));
		drop(st);
		shared.available.notify_one();
		true
	}

	/// Begin the sentinel drain and wait up to `grace` for workers to
	/// finish their current connections.
	pub fn shutdown(&self, grace: Duration) {
		let shared = &self.shared;
		{
			let mut st = shared.state.lock().expect("pool state poisoned");
			st.shutdown = true;
			st.queue.push_back(Job::Sentinel);
		}
		shared.available.notify_all();
		shared.space.notify_all();

		let deadline = Instant::now() + grace;
		let mut st = shared.state.lock().expect("pool state poisoned");
		while st.total > 0 {
			let left = deadline.saturating_duration_since(Instant::now());
			if left.is_zero() {
				debug!(workers = st.total, "grace window elapsed with workers still busy");
				return;
			}
			let (guard, _) = shared
				.available
				.wait_timeout(st, left)
				.expect("pool state poisoned");
			st = guard;
		}
	}

	pub fn counts(&self) -> (usize, usize, usize) {
		let st = self.shared.state.lock().expect("pool state poisoned");
		(st.total, st.idle, st.queue.len())
	}
}

fn spawn_worker<T: Send + 'static>(shared: &Arc<Shared<T>>, st: &mut State<T>) {
	st.total += 1;
	let shared = shared.clone();
	thread::Builder::new()
		.name("worker".to_string())
		.spawn(move || worker_loop(shared))
		.expect("spawning worker thread");
}

fn worker_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
	loop {
		let job = {
			let mut st = shared.state.lock().expect("pool state poisoned");
			st.idle += 1;
			let job = loop {
				if let Some(job) = st.queue.pop_front() {
					break job;
				}
				let (guard, timeout) = shared
					.available
					.wait_timeout(st, shared.settings.idle_timeout)
					.expect("pool state poisoned");
				st = guard;
				if timeout.timed_out()
					&& st.queue.is_empty()
					&& st.total > shared.settings.min
					&& !st.shutdown
				{
					st.idle -= 1;
					st.total -= 1;
					trace!(total = st.total, "idle worker exiting");
					return;
				}
			};
			st.idle -= 1;
			job
		};
		match job {
			Job::Item(item) => {
				(shared.handler)(item);
				shared.space.notify_one();
			},
			Job::Sentinel => {
				let mut st = shared.state.lock().expect("pool state poisoned");
				// leave the sentinel for the next worker
				st.queue.push_back(Job::Sentinel);
				st.total -= 1;
				drop(st);
				shared.available.notify_all();
				return;
			},
		}
	}
}
