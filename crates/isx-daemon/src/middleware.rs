// SPDX-License-Identifier: MIT OR Apache-2.0
//! License-validation gate: wraps every handler except a small
//! exempt set, caches a positive validation result for a fixed TTL, and
//! fails closed with a problem document (400 if invalid, 504 if the
//! validator itself times out) rather than letting the request through.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use isx_error::{ErrorCode, PipelineError};
use tower::{Layer, Service};

/// Validates whether the current license entitles this daemon to run.
///
/// Kept as a trait so tests can substitute a canned answer instead of
/// exercising a real licensing backend.
#[async_trait]
pub trait LicenseValidator: Send + Sync {
    /// Returns `true` if the license currently in effect is valid.
    async fn validate(&self) -> bool;
}

/// A validator that always reports a valid license. The default for
/// deployments with no external licensing system configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysValid;

#[async_trait]
impl LicenseValidator for AlwaysValid {
    async fn validate(&self) -> bool {
        true
    }
}

struct Cache {
    checked_at: Instant,
    valid: bool,
}

/// Gate state shared across clones of the [`tower::Service`] it produces.
#[derive(Clone)]
pub struct LicenseGate {
    validator: Arc<dyn LicenseValidator>,
    cache: Arc<StdMutex<Option<Cache>>>,
    ttl: Duration,
    validation_timeout: Duration,
    exempt_paths: Arc<Vec<String>>,
}

impl LicenseGate {
    /// Build a gate. `exempt_paths` are matched by exact path; the `/ws`
    /// upgrade and `/healthz` probe are exempt by default, in
    /// addition to whatever the caller passes.
    #[must_use]
    pub fn new(
        validator: Arc<dyn LicenseValidator>,
        ttl: Duration,
        validation_timeout: Duration,
        exempt_paths: Vec<String>,
    ) -> Self {
        Self {
            validator,
            cache: Arc::new(StdMutex::new(None)),
            ttl,
            validation_timeout,
            exempt_paths: Arc::new(exempt_paths),
        }
    }

    /// Drop any cached positive result, forcing the next request to
    /// revalidate.
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| p == path)
    }

    async fn check(&self) -> Result<(), PipelineError> {
        if let Some(cache) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            if cache.valid && cache.checked_at.elapsed() < self.ttl {
                return Ok(());
            }
        }

        let validator = Arc::clone(&self.validator);
        let outcome = tokio::time::timeout(self.validation_timeout, async move { validator.validate().await }).await;

        match outcome {
            Ok(true) => {
                *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(Cache {
                    checked_at: Instant::now(),
                    valid: true,
                });
                Ok(())
            }
            Ok(false) => Err(PipelineError::new(ErrorCode::ValidationFailed, "license is not valid")
                .with_hint("check the daemon's license configuration")),
            Err(_) => Err(PipelineError::new(ErrorCode::Timeout, "license validation timed out")
                .with_hint("the licensing backend did not respond within the configured timeout")),
        }
    }

    /// Wrap this gate in a [`tower::Layer`] to install it on a [`axum::Router`].
    #[must_use]
    pub fn into_layer(self) -> LicenseGateLayer {
        LicenseGateLayer { gate: self }
    }
}

/// [`tower::Layer`] installing [`LicenseGate`] in front of an inner service.
#[derive(Clone)]
pub struct LicenseGateLayer {
    gate: LicenseGate,
}

impl<S> Layer<S> for LicenseGateLayer {
    type Service = LicenseGateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LicenseGateService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

/// [`tower::Service`] enforcing the license gate before calling `inner`.
#[derive(Clone)]
pub struct LicenseGateService<S> {
    inner: S,
    gate: LicenseGate,
}

impl<S> Service<Request<Body>> for LicenseGateService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: IntoResponse,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if gate.is_exempt(req.uri().path()) {
                return inner.call(req).await;
            }

            match gate.check().await {
                Ok(()) => inner.call(req).await,
                Err(err) => {
                    let doc = err.to_problem_document();
                    let status = StatusCode::from_u16(doc.status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
                    Ok((status, axum::Json(doc)).into_response())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct Scripted {
        valid: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LicenseValidator for Scripted {
        async fn validate(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.valid.load(Ordering::SeqCst)
        }
    }

    struct Slow;

    #[async_trait]
    impl LicenseValidator for Slow {
        async fn validate(&self) -> bool {
            tokio::time::sleep(Duration::from_secs(60)).await;
            true
        }
    }

    #[tokio::test]
    async fn valid_license_passes_check() {
        let gate = LicenseGate::new(
            Arc::new(Scripted {
                valid: AtomicBool::new(true),
                calls: AtomicU32::new(0),
            }),
            Duration::from_secs(300),
            Duration::from_secs(5),
            vec!["/healthz".into()],
        );
        assert!(gate.check().await.is_ok());
    }

    #[tokio::test]
    async fn invalid_license_fails_check() {
        let gate = LicenseGate::new(
            Arc::new(Scripted {
                valid: AtomicBool::new(false),
                calls: AtomicU32::new(0),
            }),
            Duration::from_secs(300),
            Duration::from_secs(5),
            vec![],
        );
        let err = gate.check().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn positive_result_is_cached_within_ttl() {
        let validator = Arc::new(Scripted {
            valid: AtomicBool::new(true),
            calls: AtomicU32::new(0),
        });
        let gate = LicenseGate::new(Arc::clone(&validator) as Arc<dyn LicenseValidator>, Duration::from_secs(300), Duration::from_secs(5), vec![]);
        gate.check().await.unwrap();
        gate.check().await.unwrap();
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_revalidation() {
        let validator = Arc::new(Scripted {
            valid: AtomicBool::new(true),
            calls: AtomicU32::new(0),
        });
        let gate = LicenseGate::new(Arc::clone(&validator) as Arc<dyn LicenseValidator>, Duration::from_secs(300), Duration::from_secs(5), vec![]);
        gate.check().await.unwrap();
        gate.invalidate();
        gate.check().await.unwrap();
        assert_eq!(validator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_validator_times_out() {
        let gate = LicenseGate::new(Arc::new(Slow), Duration::from_secs(300), Duration::from_secs(5), vec![]);
        let handle = tokio::spawn(async move { gate.check().await });
        tokio::time::advance(Duration::from_secs(6)).await;
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }

    #[test]
    fn exempt_paths_match_exactly() {
        let gate = LicenseGate::new(Arc::new(AlwaysValid), Duration::from_secs(300), Duration::from_secs(5), vec!["/healthz".into(), "/ws".into()]);
        assert!(gate.is_exempt("/healthz"));
        assert!(gate.is_exempt("/ws"));
        assert!(!gate.is_exempt("/api/pipeline/start"));
    }
}
