use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use router_tree::TokenId;
use serde_json::Value;

use crate::error::RouterError;
use crate::policy::Policy;
use crate::registry::{WorkerRecord, WorkerRegistry};
use crate::tokenizer::Tokenizer;

/// Per-request affinity-aware dispatch over a worker registry. Holds no
/// per-request state itself; all mutable state lives in the registry's
/// worker records.
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    tokenizer: Arc<dyn Tokenizer>,
    policy: Policy,
    round_robin_cursor: AtomicUsize,
}

impl Dispatcher {
    pub fn new(registry: Arc<WorkerRegistry>, tokenizer: Arc<dyn Tokenizer>, policy: Policy) -> Self {
        Self {
            registry,
            tokenizer,
            policy,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// Runs one request through tokenize -> score -> select -> forward ->
    /// reconcile. The forward+reconcile tail runs as a detached task so
    /// that a caller who cancels the returned future does not leak the
    /// optimistic reference count: dropping the await here does not
    /// abort the spawned task.
    #[tracing::instrument(skip(self, request), fields(request_id = %uuid::Uuid::now_v7()))]
    pub async fn dispatch(&self, request: Value) -> Result<Value, RouterError> {
        let text = request.get("text").and_then(Value::as_str).unwrap_or("");
        let ids = self.tokenizer.encode(text);

        let workers = self.registry.workers_in_order();
        if workers.is_empty() {
            return Err(RouterError::NoWorkersAvailable);
        }
        let selected = self.select_worker(&workers, &ids);

        {
            let mut tree = selected.tree.lock().expect("lock poisoned");
            tree.insert(&ids);
        }
        selected.in_flight.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker = %selected.id, matched_ids = ids.len(), "dispatched");

        let worker = Arc::clone(&selected);
        let ids_for_task = ids.clone();
        let handle = tokio::spawn(async move {
            let outcome = worker.transport.generate(request).await;
            reconcile(&worker, &ids_for_task, outcome)
        });

        match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(RouterError::TransportFailure {
                worker: selected.id.clone(),
                source: anyhow::anyhow!(join_err),
            }),
        }
    }

    fn select_worker(&self, workers: &[Arc<WorkerRecord>], ids: &[TokenId]) -> Arc<WorkerRecord> {
        match self.policy {
            Policy::Affinity { threshold } => {
                if ids.is_empty() {
                    return select_by_load(workers);
                }
                let (best, best_rate) = score_workers(workers, ids);
                tracing::debug!(worker = %best.id, rate = best_rate, threshold, "affinity score");
                if best_rate > threshold {
                    best
                } else {
                    select_by_load(workers)
                }
            }
            Policy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst) % workers.len();
                Arc::clone(&workers[idx])
            }
            Policy::Random => {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..workers.len());
                Arc::clone(&workers[idx])
            }
        }
    }
}

/// Highest `matched_prefix_len / len(ids)` across workers; ties broken
/// by insertion order (first max found wins).
fn score_workers(workers: &[Arc<WorkerRecord>], ids: &[TokenId]) -> (Arc<WorkerRecord>, f64) {
    let mut best: Option<(Arc<WorkerRecord>, f64)> = None;
    for worker in workers {
        let matched_len = {
            let tree = worker.tree.lock().expect("lock poisoned");
            tree.prefix_match(ids).len()
        };
        let rate = matched_len as f64 / ids.len() as f64;
        let is_new_best = match &best {
            Some((_, best_rate)) => rate > *best_rate,
            None => true,
        };
        if is_new_best {
            best = Some((Arc::clone(worker), rate));
        }
    }
    best.expect("workers is non-empty")
}

/// Minimum `in_flight` across workers; ties broken by insertion order.
fn select_by_load(workers: &[Arc<WorkerRecord>]) -> Arc<WorkerRecord> {
    let mut best: Option<(Arc<WorkerRecord>, u64)> = None;
    for worker in workers {
        let load = worker.in_flight.load(Ordering::SeqCst);
        let is_new_best = match &best {
            Some((_, best_load)) => load < *best_load,
            None => true,
        };
        if is_new_best {
            best = Some((Arc::clone(worker), load));
        }
    }
    best.map(|(w, _)| w).expect("workers is non-empty")
}

/// Replaces the optimistic full-sequence insert with the truth once the
/// worker reports how much it actually cached. Runs unconditionally,
/// even on transport failure, to keep the tree's reference counts from
/// leaking.
fn reconcile(
    worker: &WorkerRecord,
    ids: &[TokenId],
    outcome: anyhow::Result<Value>,
) -> Result<Value, RouterError> {
    let result = match outcome {
        Ok(response) => match extract_cached_tokens(&response, ids.len()) {
            Ok(cached_tokens) => {
                reconcile_tree(worker, ids, Some(cached_tokens));
                Ok(response)
            }
            Err(reason) => {
                reconcile_tree(worker, ids, None);
                Err(RouterError::MalformedResponse {
                    worker: worker.id.clone(),
                    reason,
                })
            }
        },
        Err(source) => {
            reconcile_tree(worker, ids, None);
            Err(RouterError::TransportFailure {
                worker: worker.id.clone(),
                source,
            })
        }
    };
    worker.in_flight.fetch_sub(1, Ordering::SeqCst);
    result
}

fn reconcile_tree(worker: &WorkerRecord, ids: &[TokenId], cached_tokens: Option<usize>) {
    let mut tree = worker.tree.lock().expect("lock poisoned");
    if let Err(err) = tree.delete(ids) {
        tracing::warn!(worker = %worker.id, %err, "reconcile: optimistic insert already gone");
    }
    if let Some(cached) = cached_tokens {
        if cached > 0 {
            tree.insert(&ids[..cached]);
        }
    }
}

fn extract_cached_tokens(response: &Value, max_len: usize) -> Result<usize, String> {
    let cached = response
        .get("meta_info")
        .and_then(|m| m.get("cached_tokens"))
        .ok_or_else(|| "missing meta_info.cached_tokens".to_string())?;
    let cached = cached
        .as_u64()
        .ok_or_else(|| format!("meta_info.cached_tokens is not a nonnegative integer: {cached}"))?;
    let cached = cached as usize;
    if cached > max_len {
        return Err(format!(
            "meta_info.cached_tokens ({cached}) exceeds request length ({max_len})"
        ));
    }
    Ok(cached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;
    use crate::transport::WorkerTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    struct EchoTransport {
        cached_tokens: usize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl WorkerTransport for EchoTransport {
        async fn generate(&self, body: Value) -> anyhow::Result<Value> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            Ok(json!({
                "text": body.get("text"),
                "meta_info": { "cached_tokens": self.cached_tokens },
            }))
        }
    }

    fn registry_with(workers: Vec<(&str, usize)>) -> Arc<WorkerRegistry> {
        let configs: Arc<std::sync::Mutex<std::collections::HashMap<String, usize>>> =
            Arc::new(std::sync::Mutex::new(
                workers.iter().map(|(id, c)| (id.to_string(), *c)).collect(),
            ));
        Arc::new(WorkerRegistry::new(move |addr: &str| {
            let cached = *configs.lock().unwrap().get(addr).unwrap_or(&0);
            Arc::new(EchoTransport {
                cached_tokens: cached,
                fail: AtomicBool::new(false),
            }) as Arc<dyn WorkerTransport>
        }))
    }

    #[tokio::test]
    async fn affinity_selects_highest_match_rate_worker() {
        let registry = registry_with(vec![("w1", 5), ("w2", 0)]);
        registry
            .add(crate::types::WorkerId::from("w1"), "w1".into())
            .unwrap();
        registry
            .add(crate::types::WorkerId::from("w2"), "w2".into())
            .unwrap();

        // Pre-load w1's tree directly to simulate prior traffic it served.
        registry
            .workers_in_order()
            .into_iter()
            .find(|w| w.id == crate::types::WorkerId::from("w1"))
            .unwrap()
            .tree
            .lock()
            .unwrap()
            .insert(&[100, 200, 300, 400, 500]);

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(IdentityTokenizer),
            Policy::Affinity { threshold: 0.80 },
        );

        let response = dispatcher
            .dispatch(json!({ "text": "100,200,300,400,500,600" }))
            .await
            .unwrap();
        assert!(response.get("meta_info").is_some());

        let w1 = registry
            .workers_in_order()
            .into_iter()
            .find(|w| w.id == crate::types::WorkerId::from("w1"))
            .unwrap();
        let tree = w1.tree.lock().unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(
            tree.prefix_match(&[100, 200, 300, 400, 500]),
            vec![100, 200, 300, 400, 500]
        );
        assert_eq!(
            tree.prefix_match(&[100, 200, 300, 400, 500, 600]),
            vec![100, 200, 300, 400, 500]
        );
        assert_eq!(w1.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn load_balancing_fallback_picks_first_registered_on_tie() {
        let registry = registry_with(vec![("w1", 0), ("w2", 0)]);
        registry
            .add(crate::types::WorkerId::from("w1"), "w1".into())
            .unwrap();
        registry
            .add(crate::types::WorkerId::from("w2"), "w2".into())
            .unwrap();

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(ByteTokenizer),
            Policy::Affinity { threshold: 0.80 },
        );

        dispatcher.dispatch(json!({ "text": "hello" })).await.unwrap();

        let w1 = registry
            .workers_in_order()
            .into_iter()
            .find(|w| w.id == crate::types::WorkerId::from("w1"))
            .unwrap();
        // w1 was selected (first registered, both at zero in-flight) and
        // fully reconciled back to zero live sequences.
        assert_eq!(w1.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(w1.tree.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn zero_cached_tokens_does_not_leave_a_phantom_empty_sequence() {
        // A cold-cache response (cached_tokens = 0) must reconcile back to
        // no live sequence at all, not insert([]) and leave a +1 behind.
        let registry = registry_with(vec![("w1", 0)]);
        registry
            .add(crate::types::WorkerId::from("w1"), "w1".into())
            .unwrap();

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(ByteTokenizer),
            Policy::Affinity { threshold: 0.80 },
        );

        dispatcher.dispatch(json!({ "text": "hello" })).await.unwrap();
        dispatcher.dispatch(json!({ "text": "world" })).await.unwrap();

        let w1 = registry.workers_in_order().into_iter().next().unwrap();
        assert_eq!(w1.tree.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn transport_failure_still_cleans_up_reference_counts() {
        let registry = Arc::new(WorkerRegistry::new(|_addr: &str| {
            Arc::new(EchoTransport {
                cached_tokens: 0,
                fail: AtomicBool::new(true),
            }) as Arc<dyn WorkerTransport>
        }));
        registry
            .add(crate::types::WorkerId::from("w1"), "w1".into())
            .unwrap();

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(ByteTokenizer),
            Policy::Affinity { threshold: 0.80 },
        );

        let err = dispatcher
            .dispatch(json!({ "text": "hello" }))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::TransportFailure { .. }));

        let w1 = registry.workers_in_order().into_iter().next().unwrap();
        assert_eq!(w1.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(w1.tree.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn no_workers_registered_is_an_error() {
        let registry = Arc::new(WorkerRegistry::new(|_addr: &str| {
            Arc::new(crate::transport::NoopTransport) as Arc<dyn WorkerTransport>
        }));
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(ByteTokenizer),
            Policy::Affinity { threshold: 0.80 },
        );
        let err = dispatcher.dispatch(json!({ "text": "hi" })).await.unwrap_err();
        assert!(matches!(err, RouterError::NoWorkersAvailable));
    }

    /// A tokenizer that parses comma-separated token ids directly out of
    /// the request text, for tests that want to construct exact
    /// token-id sequences rather than go through real tokenization.
    struct IdentityTokenizer;
    impl Tokenizer for IdentityTokenizer {
        fn encode(&self, text: &str) -> Vec<TokenId> {
            if text.is_empty() {
                return Vec::new();
            }
            text.split(',').map(|s| s.parse().unwrap()).collect()
        }
    }
}
