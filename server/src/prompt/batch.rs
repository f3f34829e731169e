use std::future::Future;

use futures::future::join_all;
use serde::Serialize;

use super::combined::{EmailAnalysis, EmailInput};
use super::AnalysisResult;

/// Per-email result of a batch run. The originating id is carried through
/// the failure path, so callers never have to guess which email a rejection
/// belonged to.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub email_id: String,
    pub result: Result<T, String>,
}

impl<T> BatchOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Drive per-email analysis with fixed fan-out: the input is partitioned into
/// slices of `concurrency`, every request in a slice is issued concurrently,
/// and slices run strictly sequentially. Individual failures are collected,
/// never propagated, so one bad email cannot abort its siblings.
pub async fn run_analysis_batch<T, F, Fut>(
    emails: &[EmailInput],
    concurrency: usize,
    analyze_fn: F,
) -> Vec<BatchOutcome<T>>
where
    F: Fn(EmailInput) -> Fut,
    Fut: Future<Output = AnalysisResult<T>>,
{
    let mut outcomes = Vec::with_capacity(emails.len());

    for chunk in emails.chunks(concurrency.max(1)) {
        let futures = chunk.iter().map(|email| {
            let email_id = email.id.clone();
            let fut = analyze_fn(email.clone());
            async move {
                BatchOutcome {
                    email_id,
                    result: fut.await.map_err(|e| e.to_string()),
                }
            }
        });

        outcomes.extend(join_all(futures).await);
    }

    outcomes
}

/// Wire shape of one batch-analyze result item.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AnalyzedEmail {
    Analyzed {
        id: String,
        analysis: EmailAnalysis,
    },
    Failed {
        id: String,
        error: String,
    },
}

impl From<BatchOutcome<EmailAnalysis>> for AnalyzedEmail {
    fn from(outcome: BatchOutcome<EmailAnalysis>) -> Self {
        match outcome.result {
            Ok(analysis) => AnalyzedEmail::Analyzed {
                id: outcome.email_id,
                analysis,
            },
            Err(error) => AnalyzedEmail::Failed {
                id: outcome.email_id,
                error,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::super::AnalysisError;
    use super::*;

    fn emails(n: usize) -> Vec<EmailInput> {
        (0..n)
            .map(|i| EmailInput {
                id: format!("msg-{i}"),
                subject: Some(format!("subject {i}")),
                sender: None,
                preview: None,
                body: None,
                received_at: None,
                importance: None,
                is_read: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_every_input_id_appears_exactly_once() {
        let input = emails(25);
        let outcomes =
            run_analysis_batch(&input, 10, |email| async move { Ok(email.id.len()) }).await;

        assert_eq!(outcomes.len(), 25);
        let ids: HashSet<_> = outcomes.iter().map(|o| o.email_id.as_str()).collect();
        assert_eq!(ids.len(), 25);
        for email in &input {
            assert!(ids.contains(email.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_siblings() {
        let input = emails(12);
        let outcomes = run_analysis_batch(&input, 5, |email| async move {
            if email.id.ends_with('3') {
                Err(AnalysisError::MalformedResponse("bad json".to_string()))
            } else {
                Ok(())
            }
        })
        .await;

        assert_eq!(outcomes.len(), 12);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_ok()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].email_id, "msg-3");
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 11);
    }

    #[tokio::test]
    async fn test_failed_outcome_keeps_originating_id() {
        let input = emails(3);
        let outcomes = run_analysis_batch(&input, 10, |_email| async move {
            Err::<(), _>(AnalysisError::MalformedResponse("nope".to_string()))
        })
        .await;

        for (email, outcome) in input.iter().zip(&outcomes) {
            assert_eq!(email.id, outcome.email_id);
            assert!(outcome.result.is_err());
        }
    }

    #[tokio::test]
    async fn test_all_inputs_processed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let input = emails(23);
        let counter = calls.clone();
        let outcomes = run_analysis_batch(&input, 10, move |_email| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(outcomes.len(), 23);
        assert_eq!(calls.load(Ordering::SeqCst), 23);
    }
}
