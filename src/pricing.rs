//! Token pricing helpers

/// Rough token estimate from text length (~4 chars per token). Non-empty
/// text always counts as at least one token.
pub fn estimate_tokens(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    ((text.len() as i64) / 4).max(1)
}

/// Built-in per-1k prices (prompt, completion) by model family. Unknown
/// models are accounted at zero so budgets never overcount.
pub fn price_per_1k(model: &str) -> (f64, f64) {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude-opus") {
        (0.015, 0.075)
    } else if m.starts_with("claude-haiku") || m.contains("haiku") {
        (0.0008, 0.004)
    } else if m.starts_with("claude") {
        (0.003, 0.015)
    } else if m.starts_with("gpt-4o-mini") {
        (0.00015, 0.0006)
    } else if m.starts_with("gpt-4") {
        (0.0025, 0.01)
    } else if m.starts_with("o1") || m.starts_with("o3") {
        (0.015, 0.06)
    } else {
        (0.0, 0.0)
    }
}

/// Dollar cost of a request against the built-in table.
pub fn request_cost(model: &str, prompt_tokens: i64, completion_tokens: i64) -> f64 {
    let (prompt_rate, completion_rate) = price_per_1k(model);
    prompt_tokens as f64 * prompt_rate / 1000.0
        + completion_tokens as f64 * completion_rate / 1000.0
}
