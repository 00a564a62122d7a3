use crate::model::Report;
use anyhow::Result;

pub fn print_json(report: &Report) -> Result<()> {
    println!("{}", report.to_json()?);
    Ok(())
}
