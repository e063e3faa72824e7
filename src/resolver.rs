//! Ordered fallback resolution over a list of candidate backends.
//!
//! Each capability owns a statically ordered list of [`Candidate`]s, best
//! first and most degraded last. [`resolve`] tries them one at a time and
//! returns the first success. A candidate gets exactly one attempt per
//! request; there is no retry and no memory of failures across calls.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{AttemptError, AttemptFailure, PipelineError, Result};
use crate::request::{Capability, GenerationRequest, GenerationResult, Output, Provenance};

/// One concrete way to fulfil a capability.
#[async_trait]
pub trait Candidate: Send + Sync {
    /// Stable identifier recorded as provenance.
    fn name(&self) -> &str;

    /// Single bounded attempt. Implementations own their timeout.
    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<Output, AttemptError>;
}

pub type CandidateList = Vec<Box<dyn Candidate>>;

pub async fn resolve(
    capability: Capability,
    candidates: &[Box<dyn Candidate>],
    request: &GenerationRequest,
) -> Result<GenerationResult> {
    let mut attempts = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        debug!("{}: trying candidate '{}'", capability, candidate.name());
        match candidate.attempt(request).await {
            Ok(output) => {
                info!("{}: resolved by '{}'", capability, candidate.name());
                return Ok(GenerationResult {
                    payload: output.payload,
                    provenance: Provenance {
                        backend: candidate.name().to_string(),
                        extras: output.extras,
                    },
                });
            }
            Err(error) => {
                warn!("{}: candidate '{}' {}", capability, candidate.name(), error);
                attempts.push(AttemptFailure {
                    candidate: candidate.name().to_string(),
                    error,
                });
            }
        }
    }

    Err(PipelineError::Exhausted {
        capability,
        attempts,
    })
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::FakeCandidate;
    use super::*;
    use crate::request::Payload;

    fn request() -> GenerationRequest {
        GenerationRequest::new(Capability::Speech, "hello")
    }

    #[tokio::test]
    async fn first_reachable_candidate_wins_after_dead_ones() {
        let first = FakeCandidate::dead("http");
        let second = FakeCandidate::malformed("coqui");
        let third = FakeCandidate::ok("piper", Output::bytes(vec![1, 2, 3]));
        let fourth = FakeCandidate::ok("espeak", Output::bytes(vec![9]));
        let counters = [first.counter(), second.counter(), third.counter(), fourth.counter()];
        let candidates: CandidateList =
            vec![Box::new(first), Box::new(second), Box::new(third), Box::new(fourth)];

        let result = resolve(Capability::Speech, &candidates, &request()).await.unwrap();

        assert_eq!(result.provenance.backend, "piper");
        assert_eq!(result.payload, Payload::Bytes(vec![1, 2, 3]));
        let calls: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(calls, vec![1, 1, 1, 0]);
    }

    #[tokio::test]
    async fn extras_survive_into_provenance() {
        let extras = crate::request::Extras {
            seed: Some(42),
            ..Default::default()
        };
        let candidates: CandidateList = vec![Box::new(FakeCandidate::ok(
            "a1111",
            Output::bytes(vec![0]).with_extras(extras),
        ))];
        let result = resolve(Capability::Image, &candidates, &request()).await.unwrap();
        assert_eq!(result.provenance.backend, "a1111");
        assert_eq!(result.provenance.extras.seed, Some(42));
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_attempt() {
        let candidates: CandidateList = vec![
            Box::new(FakeCandidate::dead("http")),
            Box::new(FakeCandidate::malformed("coqui")),
        ];
        let err = resolve(Capability::Speech, &candidates, &request()).await.unwrap_err();
        match err {
            PipelineError::Exhausted { capability, attempts } => {
                assert_eq!(capability, Capability::Speech);
                let names: Vec<&str> = attempts.iter().map(|a| a.candidate.as_str()).collect();
                assert_eq!(names, vec!["http", "coqui"]);
                assert!(matches!(attempts[1].error, AttemptError::Malformed(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_chain_fails() {
        let candidates: CandidateList = Vec::new();
        assert!(matches!(
            resolve(Capability::Story, &candidates, &request()).await,
            Err(PipelineError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn each_call_starts_from_the_top() {
        let dead = FakeCandidate::dead("http");
        let dead_calls = dead.counter();
        let candidates: CandidateList =
            vec![Box::new(dead), Box::new(FakeCandidate::ok("piper", Output::bytes(vec![1])))];

        resolve(Capability::Speech, &candidates, &request()).await.unwrap();
        resolve(Capability::Speech, &candidates, &request()).await.unwrap();

        assert_eq!(dead_calls.load(Ordering::SeqCst), 2);
    }
}
