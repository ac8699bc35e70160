//! Human-readable run summaries and the JSON output file.

use std::collections::BTreeMap;
use std::time::Duration;

use leadscope_core::RunSummary;
use leadscope_shared::PriorityTier;

/// `$0.016`, or `< $0.001` for negligible amounts.
pub(crate) fn format_cost(usd: f64) -> String {
    if usd < 0.001 {
        "< $0.001".to_string()
    } else {
        format!("${usd:.3}")
    }
}

/// Seconds, minutes or hours with one decimal.
pub(crate) fn format_duration(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64();
    if seconds < 60.0 {
        return format!("{seconds:.1}s");
    }
    let minutes = seconds / 60.0;
    if minutes < 60.0 {
        return format!("{minutes:.1}m");
    }
    format!("{:.1}h", minutes / 60.0)
}

pub(crate) fn print_summary(summary: &RunSummary) {
    let counts = &summary.counts;
    let costs = &summary.costs;

    let mut tiers: BTreeMap<&str, usize> = BTreeMap::new();
    for result in &summary.results {
        *tiers.entry(result.tier.as_str()).or_default() += 1;
    }
    let tier_line = [
        PriorityTier::Hot,
        PriorityTier::Warm,
        PriorityTier::Watch,
        PriorityTier::Cold,
    ]
    .iter()
    .map(|t| format!("{} {}", t.as_str(), tiers.get(t.as_str()).copied().unwrap_or(0)))
    .collect::<Vec<_>>()
    .join("  ");

    println!();
    println!("  Run {} {}", summary.run_id, summary.state.as_str());
    println!(
        "  Entities: {} ({} completed, {} failed, {} cancelled)",
        counts.total(),
        counts.completed,
        counts.failed,
        counts.cancelled
    );
    println!("  Tiers:    {tier_line}");
    println!(
        "  Search:   {} credits ({}) over {} attempts",
        costs.search_credits,
        format_cost(costs.search_cost_usd),
        costs.fetch_attempts
    );
    println!(
        "  Tokens:   {} validation, {} scoring",
        costs.validator_tokens, costs.scoring_tokens
    );
    println!(
        "  Cache:    {} hits, {} misses",
        costs.cache_hits, costs.cache_misses
    );
    println!("  Time:     {}", format_duration(summary.elapsed));

    if !summary.results.is_empty() {
        println!();
        let mut ranked: Vec<_> = summary.results.iter().collect();
        ranked.sort_by(|a, b| b.total_score.cmp(&a.total_score));
        for result in ranked {
            let marker = if result.is_fallback() { " (fallback)" } else { "" };
            println!(
                "  {:<5} {:>3}  {}{marker}",
                result.tier.as_str(),
                result.total_score,
                result.entity_name
            );
        }
    }

    if !summary.failures.is_empty() {
        println!();
        println!("  Failed:");
        for (name, message) in &summary.failures {
            println!("    {name}: {message}");
        }
    }
    println!();
}

/// Machine-readable form of a run, written by `run --output`.
pub(crate) fn summary_json(summary: &RunSummary) -> serde_json::Value {
    let failures: Vec<_> = summary
        .failures
        .iter()
        .map(|(entity, error)| serde_json::json!({ "entity": entity, "error": error }))
        .collect();
    serde_json::json!({
        "run_id": summary.run_id,
        "state": summary.state,
        "counts": summary.counts,
        "costs": summary.costs,
        "elapsed_secs": summary.elapsed.as_secs_f64(),
        "results": summary.results,
        "failures": failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_formatting() {
        assert_eq!(format_cost(0.0), "< $0.001");
        assert_eq!(format_cost(0.0009), "< $0.001");
        assert_eq!(format_cost(0.016), "$0.016");
        assert_eq!(format_cost(1.5), "$1.500");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(4_200)), "4.2s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.5m");
        assert_eq!(format_duration(Duration::from_secs(5_400)), "1.5h");
    }
}
