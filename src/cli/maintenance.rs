use super::open_folio;

/// Deactivates expired access tokens.
pub fn run_maintenance(data_dir: String) -> anyhow::Result<()> {
    let folio = open_folio(&data_dir)?;
    let deactivated = folio.run_maintenance()?;
    println!("Deactivated {deactivated} expired access tokens");
    Ok(())
}
