use std::sync::{Arc, Mutex};

use budgetkv::{Completion, EventBus};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    // tracing_subscriberの初期化
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Records every completion fired on `bus`.
#[allow(dead_code)]
pub fn record_completions(bus: &EventBus<Completion>) -> Arc<Mutex<Vec<Completion>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(move |completion| sink.lock().unwrap().push(completion))
        .unwrap();
    seen
}
