use crate::types::SolutionResult;
use anyhow::Result;
use std::io::{IsTerminal, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Residuals at or below this are reported as converged
pub const RESIDUAL_TOLERANCE: f64 = 1e-6;

/// How many solution entries the summary lists
const PREVIEW_LEN: usize = 10;

/// Milliseconds as `N ms` below a second, `S.sss s` below a minute, `Mm SS.sss s` above
fn format_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{} ms", ms)
    } else if ms < 60_000 {
        format!("{:.3} s", ms as f64 / 1000.0)
    } else {
        format!("{}m {:06.3} s", ms / 60_000, (ms % 60_000) as f64 / 1000.0)
    }
}

fn residual_verdict(residual: f64) -> (&'static str, Color) {
    if residual.is_finite() && residual <= RESIDUAL_TOLERANCE {
        ("ok", Color::Green)
    } else {
        ("above tolerance", Color::Yellow)
    }
}

/// Print human-readable summary
pub fn print_summary(result: &SolutionResult) -> Result<()> {
    let mut out = StandardStream::stdout(ColorChoice::Auto);

    writeln!(out, "\nSystem:          {} x {}", result.matrix_size, result.matrix_size)?;
    if result.worker_count == 0 {
        writeln!(out, "Workers:         none (in process)")?;
    } else {
        writeln!(out, "Workers:         {}", result.worker_count)?;
    }
    writeln!(out, "Block size:      {}", result.block_size)?;
    writeln!(out, "Distributed:     {}", format_ms(result.distributed_ms))?;
    if let Some(sequential) = result.sequential_ms {
        writeln!(out, "Sequential:      {}", format_ms(sequential))?;
    }
    if let Some(speedup) = result.speedup() {
        writeln!(out, "Speedup:         {:.2}x", speedup)?;
    }

    let (verdict, color) = residual_verdict(result.max_residual);
    write!(out, "Max residual:    {:.6e}  ", result.max_residual)?;
    out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
    write!(out, "[{}]", verdict)?;
    out.reset()?;
    writeln!(out)?;
    writeln!(out, "Completed at:    {}", result.completed_at.to_rfc3339())?;

    if !result.solution.is_empty() {
        let shown = result.solution.len().min(PREVIEW_LEN);
        writeln!(out, "\nFirst {} of {} solution values:", shown, result.solution.len())?;
        for (i, x) in result.solution.iter().take(shown).enumerate() {
            writeln!(out, "  x[{}] = {:.6}", i, x)?;
        }
    }
    writeln!(out)?;
    Ok(())
}

/// Print JSON output, colored when stdout is a terminal
pub fn print_json(result: &SolutionResult) -> Result<()> {
    let json = if std::io::stdout().is_terminal() {
        colored_json::to_colored_json_auto(result)?
    } else {
        serde_json::to_string_pretty(result)?
    };
    println!("{}", json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(0), "0 ms");
        assert_eq!(format_ms(999), "999 ms");
        assert_eq!(format_ms(1000), "1.000 s");
        assert_eq!(format_ms(12_345), "12.345 s");
        assert_eq!(format_ms(61_500), "1m 01.500 s");
        assert_eq!(format_ms(754_321), "12m 34.321 s");
    }

    #[test]
    fn test_residual_verdict() {
        assert_eq!(residual_verdict(0.0).0, "ok");
        assert_eq!(residual_verdict(RESIDUAL_TOLERANCE).0, "ok");
        assert_eq!(residual_verdict(1e-3).0, "above tolerance");
        assert_eq!(residual_verdict(f64::NAN).0, "above tolerance");
    }
}
