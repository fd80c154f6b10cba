//! Full resolution: filling keys the target source cannot produce from
//! other resolve-capable sources.
//!
//! The plan is fixed when the operation starts. Each resolver source, in
//! rank order, claims the still-missing keys it supports and whose
//! dependencies the target source can supply; those dependencies are added
//! to the keys requested from the target. Every delivered item then visits
//! the resolvers one after the other.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use trove_core::{KeyId, Media, OperationOptions, Result, SupportedOps};
use trove_source::{Delivery, Registry, ReplySink, ResolveRequest, Source};

use crate::operation::Operation;

struct Step {
    source: Arc<dyn Source>,
    keys: Vec<KeyId>,
}

pub(crate) struct FullResolution {
    steps: Vec<Step>,
    options: OperationOptions,
}

/// Result of [`FullResolution::plan`].
pub(crate) struct ResolutionPlan {
    pub resolution: Option<Arc<FullResolution>>,
    /// Keys the target must additionally deliver for the resolvers.
    pub dependencies: Vec<KeyId>,
}

impl FullResolution {
    pub(crate) fn plan(
        registry: &Registry,
        target: &dyn Source,
        missing: &[KeyId],
        fast_only: bool,
    ) -> ResolutionPlan {
        let mut missing = missing.to_vec();
        let target_keys = target.supported_keys();
        let mut steps = Vec::new();
        let mut dependencies = Vec::new();

        for resolver in registry.sources_by_operation(SupportedOps::RESOLVE, true) {
            if missing.is_empty() {
                break;
            }
            if resolver.id() == target.id() {
                continue;
            }

            let slow = resolver.slow_keys();
            let mut claimed = Vec::new();
            for &key in &missing {
                if !resolver.supported_keys().contains(&key) || (fast_only && slow.contains(&key)) {
                    continue;
                }
                let Some(mut needs) = resolver.key_depends(key) else {
                    continue;
                };
                needs.extend(registry.keys().depends(key));
                if needs.iter().all(|dep| target_keys.contains(dep)) {
                    claimed.push(key);
                    dependencies.extend(needs);
                }
            }

            if !claimed.is_empty() {
                tracing::debug!(resolver = resolver.id(), keys = ?claimed, "planned full resolution step");
                missing.retain(|key| !claimed.contains(key));
                steps.push(Step {
                    source: resolver,
                    keys: claimed,
                });
            }
        }

        if !missing.is_empty() {
            tracing::debug!(target = target.id(), keys = ?missing, "no resolver for keys");
        }
        dependencies.sort();
        dependencies.dedup();

        let resolution = (!steps.is_empty()).then(|| {
            Arc::new(FullResolution {
                steps,
                options: OperationOptions::new(),
            })
        });
        ResolutionPlan {
            resolution,
            dependencies,
        }
    }

    /// Run every step on `media`, then hand the result to `done`.
    /// Failing steps are logged and skipped.
    pub(crate) fn resolve(
        self: &Arc<Self>,
        op: &Arc<Operation>,
        media: Media,
        done: impl FnOnce(Media) + Send + 'static,
    ) {
        self.clone().step(op.clone(), 0, media, Box::new(done));
    }

    fn step(
        self: Arc<Self>,
        op: Arc<Operation>,
        index: usize,
        media: Media,
        done: Box<dyn FnOnce(Media) + Send>,
    ) {
        let Some(step) = self.steps.get(index) else {
            return done(media);
        };
        if op.is_cancelled() {
            return done(media);
        }

        let source = step.source.clone();
        let keys: Vec<KeyId> = step
            .keys
            .iter()
            .copied()
            .filter(|key| !media.has(*key) && source.may_resolve(&media, *key))
            .collect();
        if keys.is_empty() {
            return self.step(op, index + 1, media, done);
        }

        let request = ResolveRequest {
            operation_id: op.id(),
            media: media.clone(),
            keys,
            options: self.options.clone(),
        };
        let token = op.token().child_token();
        let source_id = source.id().to_string();
        let this = self.clone();
        let continuation = op.clone();
        let delivery = OnFinish::new(move |outcome| {
            let mut media = media;
            match outcome {
                Ok(Some(resolved)) => {
                    media.merge_missing(&resolved);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    operation_id = %continuation.id(),
                    resolver = %source_id,
                    error = %e,
                    "full resolution step failed"
                ),
            }
            this.step(continuation, index + 1, media, done);
        });
        let sink = ReplySink::new(op.id(), source.id(), delivery, token);
        source.resolve(request, sink);
    }
}

impl fmt::Debug for FullResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| (s.source.id(), &s.keys)))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// OnFinish
// ---------------------------------------------------------------------------

type Continuation = Box<dyn FnOnce(Result<Option<Media>>) + Send>;

/// Delivery that hands the terminal outcome to a closure.
pub(crate) struct OnFinish {
    continuation: Mutex<Option<Continuation>>,
}

impl OnFinish {
    pub(crate) fn new(
        continuation: impl FnOnce(Result<Option<Media>>) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            continuation: Mutex::new(Some(Box::new(continuation))),
        })
    }
}

impl Delivery for OnFinish {
    fn item(&self, _media: Media, _remaining: u32) {
        tracing::warn!("item sent on a single-result operation; ignored");
    }

    fn finish(&self, outcome: Result<Option<Media>>) {
        let continuation = self.continuation.lock().take();
        if let Some(continuation) = continuation {
            continuation(outcome);
        }
    }
}
