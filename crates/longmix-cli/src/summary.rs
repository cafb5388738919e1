use comfy_table::modifiers::{UTF8_ROUND_CORNERS, UTF8_SOLID_INNER_BORDERS};
use comfy_table::presets::{UTF8_FULL, UTF8_FULL_CONDENSED};
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use longmix_bridge::EngineReport;
use longmix_cli::pipeline::PoolOutcome;
use longmix_core::{CellOrigin, SensitivityRun};
use longmix_model::{CellStatus, LadderState, PooledResult};

use crate::commands::{RunSummary, StatusSummary};

pub fn print_run_summary(summary: &RunSummary) {
    let report = &summary.report;
    println!("Store: {}", summary.store_root.display());
    println!(
        "Cells: {} ({} fitted, {} resumed, {} harmonized) in {:.1}s",
        report.total(),
        report.count_origin(CellOrigin::Fitted),
        report.count_origin(CellOrigin::Resumed),
        report.count_origin(CellOrigin::Harmonized),
        report.duration.as_secs_f64()
    );

    let mut table = Table::new();
    table.set_header(vec![
        header_cell("Outcome"),
        header_cell("Converged"),
        header_cell("Warning"),
        header_cell("Abandoned"),
        header_cell("Ladder states"),
    ]);
    apply_summary_table_style(&mut table);
    for index in 1..=3 {
        align_column(&mut table, index, CellAlignment::Right);
    }

    let mut outcomes: Vec<&str> = report.records().map(|r| r.key.outcome.as_str()).collect();
    outcomes.dedup();
    for outcome in outcomes {
        let records: Vec<_> = report.records().filter(|r| r.key.outcome == outcome).collect();
        let count = |status: CellStatus| records.iter().filter(|r| r.status == status).count();
        let mut states: Vec<LadderState> = records
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.final_state)
            .collect();
        states.sort();
        states.dedup();
        table.add_row(vec![
            Cell::new(outcome).add_attribute(Attribute::Bold),
            count_cell(count(CellStatus::Converged), Color::Green),
            count_cell(count(CellStatus::ConvergedWithWarning), Color::Yellow),
            count_cell(count(CellStatus::Abandoned), Color::Red),
            states_cell(&states),
        ]);
    }
    println!("{table}");

    let abandoned: Vec<_> = report
        .records()
        .filter(|r| r.status == CellStatus::Abandoned)
        .collect();
    if !abandoned.is_empty() {
        eprintln!("Abandoned cells:");
        for record in abandoned {
            let reason = record
                .failure
                .map_or_else(|| "unknown".to_string(), |f| f.to_string());
            let last = record
                .attempts
                .last()
                .and_then(|a| a.message.as_deref())
                .unwrap_or("-");
            eprintln!("- {} ({reason}): {last}", record.key);
        }
    }

    if let Some(pooled) = &summary.pooled {
        print_pooled(pooled);
    }
}

pub fn print_pooled(pooled: &[PoolOutcome]) {
    let mut table = Table::new();
    table.set_header(vec![
        header_cell("Outcome"),
        header_cell("Coefficient"),
        header_cell("Estimate"),
        header_cell("SE"),
        header_cell("df"),
        header_cell("p"),
        header_cell("95% CI"),
        header_cell("FMI"),
        header_cell("M"),
    ]);
    apply_summary_table_style(&mut table);
    for index in 2..=8 {
        align_column(&mut table, index, CellAlignment::Right);
    }

    let mut failures = Vec::new();
    for outcome in pooled {
        match &outcome.result {
            Ok(result) => add_pooled_rows(&mut table, result),
            Err(failure) => failures.push((outcome.outcome.as_str(), failure.to_string())),
        }
    }
    println!("{table}");
    if !failures.is_empty() {
        eprintln!("Not pooled:");
        for (outcome, failure) in failures {
            eprintln!("- {outcome}: {failure}");
        }
    }
}

fn add_pooled_rows(table: &mut Table, result: &PooledResult) {
    for (i, c) in result.coefficients.iter().enumerate() {
        let outcome = if i == 0 {
            Cell::new(&result.outcome).add_attribute(Attribute::Bold)
        } else {
            Cell::new("")
        };
        let df = c
            .degrees_of_freedom
            .map_or_else(|| "inf".to_string(), |df| format!("{df:.1}"));
        let p = Cell::new(format_p(c.p_value));
        let p = if c.p_value < 0.05 {
            p.add_attribute(Attribute::Bold)
        } else {
            p
        };
        table.add_row(vec![
            outcome,
            Cell::new(&c.name),
            Cell::new(format!("{:.4}", c.estimate)),
            Cell::new(format!("{:.4}", c.standard_error)),
            dim_cell(df),
            p,
            Cell::new(format!("[{:.4}, {:.4}]", c.ci_lower, c.ci_upper)),
            Cell::new(format!("{:.3}", c.fraction_missing_information)),
            dim_cell(format!(
                "{}/{}",
                result.n_successful_imputations, result.n_total_imputations
            )),
        ]);
    }
}

pub fn print_sensitivity(runs: &[SensitivityRun]) {
    for run in runs {
        println!("Alternate: {} ({})", run.label, run.store.root().display());
        let mut table = Table::new();
        table.set_header(vec![
            header_cell("Outcome"),
            header_cell("Coefficient"),
            header_cell("Baseline"),
            header_cell("Alternate"),
            header_cell("Change"),
            header_cell("Stable"),
        ]);
        apply_summary_table_style(&mut table);
        for index in 2..=4 {
            align_column(&mut table, index, CellAlignment::Right);
        }
        align_column(&mut table, 5, CellAlignment::Center);

        for report in run.reports.values() {
            if let Some(failure) = &report.alternate_failure {
                table.add_row(vec![
                    Cell::new(&report.outcome).add_attribute(Attribute::Bold),
                    dim_cell("-"),
                    dim_cell("-"),
                    dim_cell("-"),
                    Cell::new(failure).fg(Color::Red),
                    dim_cell("-"),
                ]);
                continue;
            }
            for (i, c) in report.coefficients.iter().enumerate() {
                let outcome = if i == 0 {
                    Cell::new(&report.outcome).add_attribute(Attribute::Bold)
                } else {
                    Cell::new("")
                };
                let change = c
                    .relative_change
                    .map_or_else(|| format!("{:+.4}", c.difference), |r| {
                        format!("{:+.1}%", r * 100.0)
                    });
                let stable = if c.unstable {
                    let label = if c.sign_changed { "sign flip" } else { "no" };
                    Cell::new(label).fg(Color::Red).add_attribute(Attribute::Bold)
                } else {
                    Cell::new("yes").fg(Color::Green)
                };
                table.add_row(vec![
                    outcome,
                    Cell::new(&c.name),
                    Cell::new(format!("{:.4}", c.baseline)),
                    Cell::new(format!("{:.4}", c.alternate)),
                    Cell::new(change),
                    stable,
                ]);
            }
        }
        println!("{table}");
    }
}

pub fn print_status(summary: &StatusSummary) {
    println!("Store: {}", summary.store_root.display());
    if summary.rows.is_empty() {
        println!("No cell records.");
    } else {
        let mut table = Table::new();
        table.set_header(vec![
            header_cell("Outcome"),
            header_cell("Model"),
            header_cell("Cells"),
            header_cell("Converged"),
            header_cell("Warning"),
            header_cell("Abandoned"),
            header_cell("Ladder states"),
            header_cell("Pooled"),
        ]);
        apply_table_style(&mut table);
        for index in 2..=5 {
            align_column(&mut table, index, CellAlignment::Right);
        }
        align_column(&mut table, 7, CellAlignment::Center);
        for row in &summary.rows {
            let states: Vec<LadderState> = row.ladder_states.iter().copied().collect();
            table.add_row(vec![
                Cell::new(&row.outcome).add_attribute(Attribute::Bold),
                dim_cell(short_id(row.model_spec_id.as_str())),
                Cell::new(row.total()),
                count_cell(row.converged, Color::Green),
                count_cell(row.with_warning, Color::Yellow),
                count_cell(row.abandoned, Color::Red),
                states_cell(&states),
                if row.pooled {
                    Cell::new("yes").fg(Color::Green)
                } else {
                    dim_cell("-")
                },
            ]);
        }
        println!("{table}");
    }
    if !summary.namespaces.is_empty() {
        println!("Sensitivity runs: {}", summary.namespaces.join(", "));
    }
}

pub fn print_doctor(report: &EngineReport) {
    println!("Rscript: {}", report.rscript.display());
    if let Some(error) = &report.error {
        eprintln!("error: {error}");
        return;
    }
    println!("R: {}", report.r_version.as_deref().unwrap_or("unknown"));
    let mut table = Table::new();
    table.set_header(vec![
        header_cell("Package"),
        header_cell("Required"),
        header_cell("Version"),
    ]);
    apply_table_style(&mut table);
    align_column(&mut table, 1, CellAlignment::Center);
    for package in &report.packages {
        let version = match (&package.version, package.required) {
            (Some(version), _) => Cell::new(version).fg(Color::Green),
            (None, true) => Cell::new("missing")
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
            (None, false) => Cell::new("missing").fg(Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(&package.name),
            if package.required {
                Cell::new("yes")
            } else {
                dim_cell("no")
            },
            version,
        ]);
    }
    println!("{table}");
    if report.is_ready() {
        println!("Engine ready.");
    } else {
        let missing: Vec<&str> = report.missing_required().map(|p| p.name.as_str()).collect();
        eprintln!("Missing required R packages: {}", missing.join(", "));
    }
}

pub fn apply_table_style(table: &mut Table) {
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(120);
}

fn apply_summary_table_style(table: &mut Table) {
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .apply_modifier(UTF8_SOLID_INNER_BORDERS)
        .set_content_arrangement(ContentArrangement::DynamicFullWidth)
        .set_width(140);
}

fn align_column(table: &mut Table, index: usize, alignment: CellAlignment) {
    if let Some(column) = table.column_mut(index) {
        column.set_cell_alignment(alignment);
    }
}

fn header_cell(label: &str) -> Cell {
    Cell::new(label)
        .fg(Color::Cyan)
        .add_attribute(Attribute::Bold)
}

fn count_cell(count: usize, color: Color) -> Cell {
    if count > 0 {
        Cell::new(count).fg(color).add_attribute(Attribute::Bold)
    } else {
        dim_cell(count)
    }
}

fn states_cell(states: &[LadderState]) -> Cell {
    let text = states
        .iter()
        .copied()
        .map(LadderState::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    match states.len() {
        0 => dim_cell("-"),
        1 => Cell::new(text),
        _ => Cell::new(text).fg(Color::Yellow),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn format_p(p: f64) -> String {
    if p < 0.001 {
        "<0.001".to_string()
    } else {
        format!("{p:.3}")
    }
}

fn dim_cell<T: ToString>(value: T) -> Cell {
    Cell::new(value).fg(Color::DarkGrey)
}
