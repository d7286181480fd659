use crate::types::SolutionResult;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};

/// Export the solution vector to CSV
pub fn export_solution_csv(result: &SolutionResult, path: &str) -> Result<()> {
    let file = File::create(path)
        .context(format!("Failed to create CSV file: {}", path))?;
    let mut file = BufWriter::new(file);

    writeln!(file, "index,value")?;
    for (index, value) in result.solution.iter().enumerate() {
        writeln!(file, "{},{}", index, value)?;
    }

    file.flush()
        .context(format!("Failed to write CSV file: {}", path))?;
    Ok(())
}
