use spool_broker::DiagnosticReport;
use std::fmt::Write as _;

pub fn render_diagnostic_report(report: &DiagnosticReport) -> String {
    let mut md = String::new();
    md.push_str("# Spool diagnostic report\n\n");
    let _ = writeln!(md, "- Root: `{}`", report.root.display());
    let _ = writeln!(md, "- Generated: `{}`", report.generated_at);
    let _ = writeln!(
        md,
        "- Health: `{}` (score {}/100)\n",
        report.status.as_str(),
        report.health_score
    );

    if !report.root_exists {
        md.push_str("The shared directory does not exist or is not a directory.\n");
        return md;
    }

    let _ = writeln!(
        md,
        "Pending requests: {}. Recent failures: {}.\n",
        report.pending_requests, report.recent_errors
    );

    md.push_str("## Stale requests\n\n");
    if report.stale_requests.is_empty() {
        md.push_str("None.\n\n");
    } else {
        md.push_str("| file | session | age |\n");
        md.push_str("|---|---|---:|\n");
        for stale in &report.stale_requests {
            let _ = writeln!(
                md,
                "| `{}` | `{}` | {} |",
                escape_cell(&stale.file_name),
                stale.session_id.as_ref().map_or("n/a", |s| s.as_str()),
                format_age(stale.age_ms)
            );
        }
        md.push('\n');
    }

    md.push_str("## Responses\n\n");
    let _ = writeln!(
        md,
        "Checked {} most recent, {} malformed ({:.0}%).\n",
        report.responses.checked,
        report.responses.malformed,
        report.responses.malformed_ratio * 100.0
    );
    for issue in &report.responses.issues {
        let defects = issue
            .defects
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        let _ = writeln!(
            md,
            "- `{}`: {}",
            issue.file_name,
            truncate_one_line(&defects, 160)
        );
    }
    if !report.responses.issues.is_empty() {
        md.push('\n');
    }

    md.push_str("## Error patterns\n\n");
    if report.error_patterns.is_empty() {
        md.push_str("None.\n");
    } else {
        md.push_str("| count | kind | signature | example |\n");
        md.push_str("|---:|---|---|---|\n");
        for pattern in &report.error_patterns {
            let _ = writeln!(
                md,
                "| {} | `{}` | `{}` | `{}` |",
                pattern.count,
                pattern.kind.as_str(),
                escape_cell(&truncate_one_line(&pattern.signature, 120)),
                pattern
                    .example_session
                    .as_ref()
                    .map_or("n/a", |s| s.as_str())
            );
        }
    }
    md
}

fn format_age(age_ms: u64) -> String {
    let secs = age_ms / 1000;
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

fn truncate_one_line(text: &str, max_chars: usize) -> String {
    let mut s = text.replace(['\n', '\r', '\t'], " ");
    s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if s.chars().count() <= max_chars {
        return s;
    }
    let truncated: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}…")
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}
