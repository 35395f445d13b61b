//! Create a fresh PST with a mailbox, one folder, and one message.

use anyhow::Context;
use clap::Parser;
use pst_core::{messaging::store::Store, ndb::header::NdbCryptMethod, UnicodePstFile};

#[derive(Parser)]
struct Args {
    /// Path of the PST file to create; must not exist yet.
    path: std::path::PathBuf,

    /// Store display name.
    #[arg(long, default_value = "MailBox")]
    name: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let db = UnicodePstFile::create(&args.path, NdbCryptMethod::Permute)
        .with_context(|| format!("creating {}", args.path.display()))?;

    let mut store = Store::create(db.clone())?;
    store.set_display_name(&args.name)?;
    store.save()?;

    let mut root = store.open_root_folder()?;
    let mut inbox = root.create_subfolder("Inbox")?;
    let mut message = inbox.create_message("IPM.Note")?;
    message.set_subject("Welcome")?;
    message.set_body("This mailbox was created by the create_pst example.")?;
    message.save()?;
    inbox.save()?;
    root.save()?;

    db.commit()?;
    println!("created {} with store {:?}", args.path.display(), args.name);
    Ok(())
}
