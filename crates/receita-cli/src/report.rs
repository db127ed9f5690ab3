//! Text rendering of run summaries, catalogs, layouts and progress.

use receita_core::layout::LayoutRegistry;
use receita_core::models::Release;
use receita_core::progress::Ledger;
use receita_core::sync::RunSummary;
use std::fmt::Write;

pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Release {}: {} ({})",
        summary.release, summary.state, summary.reason
    );

    for report in &summary.reports {
        let _ = write!(out, "  {:<28} {:<15}", report.name, report.outcome.as_str());
        if let Some(table) = &report.table {
            let _ = write!(out, " {} ({} rows", table, report.rows);
            if report.dates_coerced > 0 {
                let _ = write!(out, ", {} dates nulled", report.dates_coerced);
            }
            out.push(')');
        }
        if let Some(error) = &report.error {
            let _ = write!(out, " {}", error);
        }
        out.push('\n');
    }

    if !summary.reports.is_empty() {
        let stats = summary.stats();
        let _ = writeln!(
            out,
            "{} loaded, {} downloaded, {} already loaded, {} failed, {} rows",
            stats.loaded, stats.downloaded, stats.already_loaded, stats.failed, stats.rows
        );
        let _ = writeln!(
            out,
            "Marker {}",
            if summary.marker_committed {
                "committed"
            } else {
                "unchanged"
            }
        );
    }
    out
}

pub fn render_catalog(release: &Release, registry: &LayoutRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Last update {}: {} archive(s)",
        release.last_update,
        release.entries.len()
    );
    for entry in &release.entries {
        let target = registry
            .get(&entry.record_type)
            .map(|layout| layout.table.as_str())
            .unwrap_or("unknown");
        let _ = writeln!(out, "  {:<28} {:<20} {}", entry.name, target, entry.url);
    }
    out
}

pub fn render_layouts(registry: &LayoutRegistry) -> String {
    let mut out = String::new();
    for layout in registry.layouts() {
        let _ = writeln!(
            out,
            "{} -> {} ({} columns)",
            layout.record_type,
            layout.table,
            layout.width()
        );
        for column in &layout.columns {
            let _ = writeln!(out, "    {:<32} {}", column.name, column.kind.sql_type());
        }
    }
    if !registry.indexes().is_empty() {
        out.push_str("Indexes:\n");
        for index in registry.indexes() {
            let _ = writeln!(out, "    {} ON {} ({})", index.name, index.table, index.column);
        }
    }
    out
}

pub fn render_status(marker: Option<&str>, ledger: &Ledger) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Last ingested release: {}", marker.unwrap_or("never"));
    match &ledger.release {
        Some(release) => {
            let _ = writeln!(
                out,
                "Ledger for {}: {} file(s) loaded",
                release,
                ledger.files.len()
            );
        }
        None => out.push_str("Ledger empty\n"),
    }
    for (name, entry) in &ledger.files {
        let _ = writeln!(
            out,
            "  {:<28} {:<20} {:>10} rows  {}",
            name,
            entry.table,
            entry.rows,
            entry.loaded_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    for (name, partial) in &ledger.partial {
        let _ = writeln!(
            out,
            "  {:<28} {:<20} partial since {}, reload with --truncate",
            name,
            partial.table,
            partial.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use receita_core::models::FileEntry;
    use receita_core::progress::PartialEntry;
    use receita_core::sync::{FileOutcome, FileReport, RunState};
    use std::collections::BTreeSet;

    #[test]
    fn test_render_summary() {
        let mut loaded = FileReport::new("Empresas0.zip", FileOutcome::Loaded);
        loaded.table = Some("tb_empresa".to_string());
        loaded.rows = 42;
        loaded.dates_coerced = 1;
        let summary = RunSummary {
            state: RunState::Done,
            release: "12/03/2024".to_string(),
            reason: "release changed",
            reports: vec![
                loaded,
                FileReport::failed(
                    "Unknown.zip",
                    FileOutcome::UnknownLayout,
                    "No layout registered for Unknown.zip".to_string(),
                ),
            ],
            marker_committed: true,
            uploaded: BTreeSet::from(["Empresas0.zip".to_string()]),
        };

        let text = render_summary(&summary);
        assert!(text.starts_with("Release 12/03/2024: DONE (release changed)\n"));
        assert!(text.contains("tb_empresa (42 rows, 1 dates nulled)"));
        assert!(text.contains("unknown_layout"));
        assert!(text.contains("1 loaded, 0 downloaded, 0 already loaded, 1 failed, 42 rows"));
        assert!(text.ends_with("Marker committed\n"));
    }

    #[test]
    fn test_render_skipped_summary() {
        let summary = RunSummary::skipped("12/03/2024".to_string(), "release unchanged");
        assert_eq!(
            render_summary(&summary),
            "Release 12/03/2024: SKIPPED (release unchanged)\n"
        );
    }

    #[test]
    fn test_render_catalog_marks_unknown() {
        let release = Release {
            last_update: "12/03/2024".to_string(),
            entries: vec![
                FileEntry::new("Cnaes.zip", "http://h/Cnaes.zip"),
                FileEntry::new("Unknown.zip", "http://h/Unknown.zip"),
            ],
        };
        let text = render_catalog(&release, &LayoutRegistry::cnpj());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Last update 12/03/2024: 2 archive(s)");
        assert!(lines[1].contains("tb_cnae"));
        assert!(lines[2].contains("unknown"));
    }

    #[test]
    fn test_render_status_never_run() {
        let text = render_status(None, &Ledger::default());
        assert_eq!(text, "Last ingested release: never\nLedger empty\n");
    }

    #[test]
    fn test_render_status_flags_partial_load() {
        let mut ledger = Ledger {
            release: Some("12/03/2024".to_string()),
            ..Ledger::default()
        };
        ledger.partial.insert(
            "Cnaes.zip".to_string(),
            PartialEntry {
                started_at: chrono::Utc::now(),
                table: "tb_cnae".to_string(),
            },
        );
        let text = render_status(Some("10/02/2024"), &ledger);
        assert!(text.contains("Ledger for 12/03/2024: 0 file(s) loaded"));
        let line = text.lines().last().unwrap();
        assert!(line.contains("Cnaes.zip"));
        assert!(line.contains("tb_cnae"));
        assert!(line.contains("--truncate"));
    }

    #[test]
    fn test_render_layouts_lists_every_table() {
        let registry = LayoutRegistry::cnpj();
        let text = render_layouts(&registry);
        for layout in registry.layouts() {
            assert!(text.contains(&format!("{} -> {}", layout.record_type, layout.table)));
        }
        assert!(text.contains("Indexes:"));
    }
}
