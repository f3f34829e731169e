use std::future::Future;

use serde::Serialize;

use crate::rate_limiters::RateLimiters;
use crate::server_config::{cfg, ModelPrice};
use crate::HttpClient;

use super::batch::{run_analysis_batch, BatchOutcome};
use super::combined::{
    analyze_email, quick_analyze_email, EmailAnalysis, EmailInput, QuickAnalysis,
};
use super::AnalysisResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisPass {
    Quick,
    Deep,
}

/// Final per-email result of the tiered analyzer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartResult {
    pub email_id: String,
    pub pass: AnalysisPass,
    pub analysis: EmailAnalysis,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEmail {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartAnalysisReport {
    pub results: Vec<SmartResult>,
    pub failures: Vec<FailedEmail>,
    pub processed_count: usize,
    /// Advisory estimate in USD, never enforced as a budget.
    pub estimated_cost: f64,
}

/// Lift a quick-pass classification into the full enrichment shape. Fields
/// only the deep pass produces stay empty.
pub fn promote_quick(quick: QuickAnalysis) -> EmailAnalysis {
    EmailAnalysis {
        priority: quick.priority,
        priority_reason: None,
        sentiment: quick.sentiment,
        category: quick.category,
        cluster: None,
        summary: None,
        action_items: Vec::new(),
        key_dates: Vec::new(),
        suggested_tags: Vec::new(),
        needs_reply: quick.needs_reply,
        estimated_read_minutes: None,
        model_id: None,
    }
}

/// Emails whose quick-pass priority exceeds the threshold get the deep pass.
pub fn select_for_deep_pass<'a>(
    emails: &'a [EmailInput],
    quick_outcomes: &[BatchOutcome<QuickAnalysis>],
    threshold: i32,
) -> Vec<&'a EmailInput> {
    emails
        .iter()
        .filter(|email| {
            quick_outcomes
                .iter()
                .find(|o| o.email_id == email.id)
                .map(|o| matches!(&o.result, Ok(quick) if quick.priority > threshold))
                .unwrap_or(false)
        })
        .collect()
}

/// Merge the two stages: a successful deep result replaces the quick one,
/// a failed deep attempt falls back to the quick result, and quick failures
/// are reported as such.
pub fn merge_results(
    quick_outcomes: Vec<BatchOutcome<QuickAnalysis>>,
    mut deep_outcomes: Vec<BatchOutcome<EmailAnalysis>>,
) -> (Vec<SmartResult>, Vec<FailedEmail>) {
    let mut results = Vec::with_capacity(quick_outcomes.len());
    let mut failures = Vec::new();

    for outcome in quick_outcomes {
        let quick = match outcome.result {
            Ok(quick) => quick,
            Err(error) => {
                failures.push(FailedEmail {
                    id: outcome.email_id,
                    error,
                });
                continue;
            }
        };

        let deep = deep_outcomes
            .iter()
            .position(|d| d.email_id == outcome.email_id)
            .map(|idx| deep_outcomes.swap_remove(idx));

        match deep {
            Some(BatchOutcome {
                result: Ok(analysis),
                ..
            }) => results.push(SmartResult {
                email_id: outcome.email_id,
                pass: AnalysisPass::Deep,
                analysis,
            }),
            _ => results.push(SmartResult {
                email_id: outcome.email_id,
                pass: AnalysisPass::Quick,
                analysis: promote_quick(quick),
            }),
        }
    }

    (results, failures)
}

const PROMPT_OVERHEAD_TOKENS: f64 = 220.0;
const CHARS_PER_TOKEN: f64 = 4.0;
const QUICK_OUTPUT_TOKENS: f64 = 60.0;
const DEEP_OUTPUT_TOKENS: f64 = 400.0;

/// Advisory cost estimate in USD from published per-model token prices.
pub fn estimate_cost(
    quick_calls: usize,
    deep_calls: usize,
    avg_body_chars: usize,
    quick_price: &ModelPrice,
    deep_price: &ModelPrice,
) -> f64 {
    let input_tokens = PROMPT_OVERHEAD_TOKENS + avg_body_chars as f64 / CHARS_PER_TOKEN;
    let quick_cost = quick_calls as f64
        * (input_tokens * quick_price.input_per_mtok + QUICK_OUTPUT_TOKENS * quick_price.output_per_mtok)
        / 1_000_000.0;
    let deep_cost = deep_calls as f64
        * (input_tokens * deep_price.input_per_mtok + DEEP_OUTPUT_TOKENS * deep_price.output_per_mtok)
        / 1_000_000.0;

    quick_cost + deep_cost
}

pub fn avg_content_len(emails: &[EmailInput]) -> usize {
    if emails.is_empty() {
        return 0;
    }
    emails.iter().map(EmailInput::content_len).sum::<usize>() / emails.len()
}

/// Two-stage driver, generic over the per-email analyzers so the staging
/// logic can be exercised without the network.
pub async fn run_two_pass<QF, QFut, DF, DFut>(
    emails: &[EmailInput],
    concurrency: usize,
    threshold: i32,
    quick_fn: QF,
    deep_fn: DF,
) -> (Vec<SmartResult>, Vec<FailedEmail>, usize)
where
    QF: Fn(EmailInput) -> QFut,
    QFut: Future<Output = AnalysisResult<QuickAnalysis>>,
    DF: Fn(EmailInput) -> DFut,
    DFut: Future<Output = AnalysisResult<EmailAnalysis>>,
{
    let quick_outcomes = run_analysis_batch(emails, concurrency, quick_fn).await;

    let deep_inputs: Vec<EmailInput> = select_for_deep_pass(emails, &quick_outcomes, threshold)
        .into_iter()
        .cloned()
        .collect();
    let deep_count = deep_inputs.len();

    let deep_outcomes = run_analysis_batch(&deep_inputs, concurrency, deep_fn).await;

    let (results, failures) = merge_results(quick_outcomes, deep_outcomes);
    (results, failures, deep_count)
}

/// Quick pass over everything, deep pass over the high-priority subset.
pub async fn run_smart_analysis(
    http_client: &HttpClient,
    rate_limiters: &RateLimiters,
    emails: &[EmailInput],
) -> SmartAnalysisReport {
    let threshold = cfg.model.priority_threshold;
    let concurrency = cfg.analysis.batch_concurrency;

    let (results, failures, deep_count) = run_two_pass(
        emails,
        concurrency,
        threshold,
        |email| {
            let http_client = http_client.clone();
            let rate_limiters = rate_limiters.clone();
            async move {
                quick_analyze_email(&http_client, &rate_limiters, &email, &cfg.model.quick_id).await
            }
        },
        |email| {
            let http_client = http_client.clone();
            let rate_limiters = rate_limiters.clone();
            async move {
                analyze_email(&http_client, &rate_limiters, &email, &cfg.model.deep_id).await
            }
        },
    )
    .await;

    let estimated_cost = match (
        cfg.model.price_for(&cfg.model.quick_id),
        cfg.model.price_for(&cfg.model.deep_id),
    ) {
        (Some(quick_price), Some(deep_price)) => estimate_cost(
            emails.len(),
            deep_count,
            avg_content_len(emails),
            quick_price,
            deep_price,
        ),
        _ => 0.0,
    };

    let processed_count = results.len();
    SmartAnalysisReport {
        results,
        failures,
        processed_count,
        estimated_cost,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use super::super::AnalysisError;
    use super::*;

    fn email(id: &str) -> EmailInput {
        EmailInput {
            id: id.to_string(),
            subject: Some(format!("subject {id}")),
            sender: None,
            preview: None,
            body: None,
            received_at: None,
            importance: None,
            is_read: None,
        }
    }

    fn quick(priority: i32) -> QuickAnalysis {
        QuickAnalysis {
            priority,
            category: "work".to_string(),
            sentiment: "neutral".to_string(),
            needs_reply: false,
        }
    }

    fn deep(priority: i32) -> EmailAnalysis {
        EmailAnalysis {
            priority,
            priority_reason: Some("deep".to_string()),
            sentiment: "urgent".to_string(),
            category: "work".to_string(),
            cluster: Some("c1".to_string()),
            summary: Some("deep summary".to_string()),
            action_items: Vec::new(),
            key_dates: Vec::new(),
            suggested_tags: Vec::new(),
            needs_reply: true,
            estimated_read_minutes: Some(2),
            model_id: None,
        }
    }

    #[tokio::test]
    async fn test_deep_pass_hits_exactly_the_above_threshold_subset() {
        // Priorities 10, 40, 70, 71, 90 with threshold 70: only 71 and 90 go deep.
        let emails: Vec<EmailInput> = ["a", "b", "c", "d", "e"].iter().map(|id| email(id)).collect();
        let priorities = [10, 40, 70, 71, 90];

        let deep_calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let deep_calls_clone = deep_calls.clone();

        let (results, failures, deep_count) = run_two_pass(
            &emails,
            10,
            70,
            |e| {
                let idx = ["a", "b", "c", "d", "e"]
                    .iter()
                    .position(|id| *id == e.id)
                    .unwrap();
                async move { Ok(quick(priorities[idx])) }
            },
            move |e| {
                deep_calls_clone.lock().unwrap().push(e.id.clone());
                async move { Ok(deep(95)) }
            },
        )
        .await;

        assert!(failures.is_empty());
        assert_eq!(deep_count, 2);

        let called: HashSet<String> = deep_calls.lock().unwrap().iter().cloned().collect();
        assert_eq!(called, HashSet::from(["d".to_string(), "e".to_string()]));

        for result in &results {
            match result.email_id.as_str() {
                "d" | "e" => {
                    assert_eq!(result.pass, AnalysisPass::Deep);
                    assert_eq!(result.analysis.summary.as_deref(), Some("deep summary"));
                }
                _ => {
                    assert_eq!(result.pass, AnalysisPass::Quick);
                    assert!(result.analysis.summary.is_none());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_below_threshold_keeps_quick_result_unchanged() {
        let emails = vec![email("a")];
        let (results, _, deep_count) = run_two_pass(
            &emails,
            10,
            70,
            |_| async { Ok(quick(30)) },
            |_| async { Ok(deep(99)) },
        )
        .await;

        assert_eq!(deep_count, 0);
        assert_eq!(results[0].pass, AnalysisPass::Quick);
        assert_eq!(results[0].analysis.priority, 30);
    }

    #[tokio::test]
    async fn test_deep_failure_falls_back_to_quick() {
        let emails = vec![email("a")];
        let (results, failures, _) = run_two_pass(
            &emails,
            10,
            70,
            |_| async { Ok(quick(90)) },
            |_| async { Err(AnalysisError::MalformedResponse("bad".to_string())) },
        )
        .await;

        assert!(failures.is_empty());
        assert_eq!(results[0].pass, AnalysisPass::Quick);
        assert_eq!(results[0].analysis.priority, 90);
    }

    #[tokio::test]
    async fn test_quick_failure_is_reported() {
        let emails = vec![email("a"), email("b")];
        let (results, failures, _) = run_two_pass(
            &emails,
            10,
            70,
            |e| async move {
                if e.id == "a" {
                    Err(AnalysisError::MalformedResponse("bad".to_string()))
                } else {
                    Ok(quick(10))
                }
            },
            |_| async { Ok(deep(99)) },
        )
        .await;

        assert_eq!(results.len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "a");
    }

    #[test]
    fn test_estimate_cost_known_numbers() {
        let quick_price = ModelPrice {
            id: "quick".to_string(),
            input_per_mtok: 1.0,
            output_per_mtok: 2.0,
        };
        let deep_price = ModelPrice {
            id: "deep".to_string(),
            input_per_mtok: 10.0,
            output_per_mtok: 20.0,
        };

        // 2000 chars -> 500 body tokens + 220 overhead = 720 input tokens.
        // Quick: 10 * (720 * 1 + 60 * 2) / 1e6 = 0.0084
        // Deep:   2 * (720 * 10 + 400 * 20) / 1e6 = 0.0304
        let cost = estimate_cost(10, 2, 2000, &quick_price, &deep_price);
        assert!((cost - 0.0388).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_cost_zero_emails() {
        let price = ModelPrice {
            id: "m".to_string(),
            input_per_mtok: 1.0,
            output_per_mtok: 1.0,
        };
        assert_eq!(estimate_cost(0, 0, 0, &price, &price), 0.0);
    }
}
