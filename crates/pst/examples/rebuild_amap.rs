//! Force an allocation-map rebuild by clearing the validity flag, then
//! reopening the file.

use anyhow::Context;
use clap::Parser;
use pst_core::{
    ndb::{header::Header, root::AmapStatus},
    Unicode, UnicodePstFile,
};

#[derive(Parser)]
struct Args {
    /// Path of the PST file to rebuild.
    path: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&args.path)
            .with_context(|| format!("opening {}", args.path.display()))?;
        let mut header = Header::<Unicode>::reload(&mut file)?;
        header.root_mut().set_amap_status(AmapStatus::Invalid);
        header.flush(&mut file)?;
    }

    let db = UnicodePstFile::open(&args.path)?;
    let root = db.root_info()?;
    println!(
        "rebuilt; AMap status {:?}, {} bytes free",
        root.amap_is_valid(),
        root.amap_free_size()
    );
    Ok(())
}
