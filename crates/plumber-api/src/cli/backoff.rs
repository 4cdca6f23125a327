//! Backoff delay inspection command.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use plumber_core::engine::backoff::BackoffPolicy;

/// Print the jittered delay for one attempt, or for every allowed attempt.
pub fn show_backoff(policy: &BackoffPolicy, attempt: Option<u32>, json: bool) -> Result<()> {
    let attempts: Vec<u32> = match attempt {
        Some(n) => vec![n],
        None => (1..=policy.max_attempts.max(1)).collect(),
    };

    let rows: Vec<(u32, u64, u64)> = attempts
        .iter()
        .map(|&n| (n, policy.base_delay_ms(n), policy.delay_ms(n)))
        .collect();

    if json {
        let entries: Vec<serde_json::Value> = rows
            .iter()
            .map(|(n, base, delay)| {
                serde_json::json!({
                    "attempt": n,
                    "base_delay_ms": base,
                    "delay_ms": delay,
                    "retry_allowed": policy.should_retry(*n),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Attempt").fg(Color::White),
        Cell::new("Base (ms)").fg(Color::White),
        Cell::new("Delay (ms)").fg(Color::White),
        Cell::new("Retry?").fg(Color::White),
    ]);

    for (n, base, delay) in &rows {
        let retry = if policy.should_retry(*n) {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(n),
            Cell::new(base),
            Cell::new(delay),
            retry,
        ]);
    }

    println!();
    println!(
        "  {} initial delay {}ms, max {} attempts",
        style("⏱").bold(),
        policy.initial_delay_ms,
        policy.max_attempts
    );
    println!("{table}");
    println!();
    Ok(())
}
