//! Build result rendering.

use console::style;

use sw_lib::build::BuildReport;
use sw_lib::execute::CommandOutcome;
use sw_lib::util::hash::ObjectHash;

/// Print per-command diagnostics for failures plus the summary counts.
pub fn print_report(report: &BuildReport, settings_digest: &ObjectHash) {
  for entry in &report.summary.reports {
    match &entry.outcome {
      CommandOutcome::Failed { exit_code, stderr } => {
        println!();
        println!(
          "{} {} (settings {})",
          style("FAILED").red().bold(),
          entry.name,
          settings_digest
        );
        match exit_code {
          Some(code) => println!("  exit code: {code}"),
          None => println!("  terminated by signal"),
        }
        println!("  {} {}", entry.program.display(), entry.args.join(" "));
        for line in stderr.lines().rev().take(20).collect::<Vec<_>>().into_iter().rev() {
          println!("  {} {}", style(">").dim(), line);
        }
      }
      CommandOutcome::Timeout => {
        println!();
        println!("{} {} (timed out)", style("FAILED").red().bold(), entry.name);
      }
      CommandOutcome::Poisoned { ancestor } => {
        println!(
          "{} {} (not built due to {})",
          style("skipped").yellow(),
          entry.name,
          ancestor
        );
      }
      _ => {}
    }
  }

  println!();
  println!(
    "{} {} executed, {} up-to-date, {} failed, {} poisoned, {} skipped",
    style("Summary:").bold(),
    report.summary.executed(),
    report.summary.up_to_date(),
    report.summary.failed(),
    report.summary.poisoned(),
    report.summary.skipped()
  );
  println!(
    "  {} package(s) resolved, {} newly installed, {} target(s)",
    report.packages.len(),
    report.installed.len(),
    report.target_count
  );
}
