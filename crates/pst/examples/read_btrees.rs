//! Dump the NBT and BBT leaf entries of a PST.

use anyhow::Context;
use clap::Parser;
use pst_core::UnicodePstFile;

#[derive(Parser)]
struct Args {
    /// Path of the PST file to read.
    path: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let db = UnicodePstFile::open(&args.path)
        .with_context(|| format!("opening {}", args.path.display()))?;

    println!("Node BTree:");
    for info in db.node_infos()? {
        println!(
            "  {:?} data: {:?} sub: {:?} parent: {:?}",
            info.node, info.data, info.sub_node, info.parent
        );
    }

    println!("Block BTree:");
    for info in db.block_infos()? {
        println!(
            "  {:?} offset: 0x{:X} size: 0x{:X} refs: {}",
            info.block,
            info.index.index(),
            info.size,
            info.ref_count
        );
    }

    Ok(())
}
