pub const RANKING_TITLE: &str = "Voice time ranking";
pub const RANKING_COLOUR: u32 = 0x0099FF;
pub const EMPTY_RANKING: &str = "Nobody has recorded any voice time yet.";

pub fn format_time(ms: u64) -> String {
    if ms < 1000 {
        return "<1s".to_string();
    }
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}

pub fn status_text(total_ms: u64) -> String {
    let total_mins = total_ms / 60_000;
    format!("Total: {}h {}m", total_mins / 60, total_mins % 60)
}

/// One line per ranked user, names already resolved.
pub fn ranking_description(rows: &[(String, u64)]) -> String {
    rows.iter()
        .map(|(name, total)| format!("**{}**: {}\n", name, format_time(*total)))
        .collect()
}
