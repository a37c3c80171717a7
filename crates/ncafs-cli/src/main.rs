use clap::{Parser, Subcommand};
use ncafs::crypto::keyset::{KeySet, SystemKeysetError};
use ncafs::crypto::AesKey;
use ncafs::fssystem::{NcaError, NcaFileSystemDriver, NcaFsHeaderReader, NcaReader};
use snafu::{ErrorCompat, ResultExt, Snafu};
use ncafs::storage::{
    FileRoStorage, ReadableStorage, ReadableStorageExt, StorageError, VirtualFile,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[clap(version = "0.1.0", about = "Inspect and extract Nintendo Content Archives")]
struct Opts {
    /// Directory containing prod.keys / title.keys (defaults to the
    /// standard system locations)
    #[clap(long, global = true)]
    keys: Option<PathBuf>,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Print header metadata and per-section info
    Info(InfoOpts),
    /// Decrypt one FS section and write it to a file
    Extract(ExtractOpts),
}

#[derive(Parser)]
struct InfoOpts {
    nca: PathBuf,
}

#[derive(Parser)]
struct ExtractOpts {
    nca: PathBuf,

    /// FS section index (0-3)
    #[clap(long, default_value = "0")]
    section: usize,

    /// Output file for the decrypted section image
    #[clap(long, short)]
    output: PathBuf,

    /// Skip the hash/compression layers and dump the raw section
    #[clap(long)]
    raw: bool,

    /// External titlekey (hex), already unwrapped, for rights-id content
    #[clap(long)]
    titlekey: Option<String>,
}

#[derive(Snafu, Debug)]
enum CliError {
    /// Could not load the keyset
    Keyset { source: SystemKeysetError },
    /// Could not open the NCA file
    Open { source: StorageError },
    /// Could not parse the NCA
    Nca { source: NcaError },
    /// Could not read section data
    Storage { source: StorageError },
    /// Invalid titlekey argument
    BadTitlekey,
}

fn load_nca(
    path: &PathBuf,
    keys: Option<&PathBuf>,
    titlekey: Option<&str>,
) -> Result<NcaReader, CliError> {
    let key_set = KeySet::from_system(keys.map(|p| p.as_path())).context(KeysetSnafu)?;

    let storage: VirtualFile = Arc::new(FileRoStorage::open(path).context(OpenSnafu)?);
    let mut reader = NcaReader::new(storage, &key_set).context(NcaSnafu)?;

    if !reader.get_rights_id().is_empty() {
        // Prefer an explicit titlekey; otherwise look one up in the
        // keyset and unwrap it with the matching titlekek.
        if let Some(titlekey) = titlekey {
            let key: AesKey = titlekey.parse().map_err(|_| CliError::BadTitlekey)?;
            reader.set_external_decryption_key(key);
        } else {
            let title_key = key_set
                .title_key(&reader.get_rights_id())
                .map_err(|source| CliError::Nca {
                    source: NcaError::MissingTitleKey { source },
                })?;
            let master_key_id = std::cmp::max(reader.get_key_generation(), 1) - 1;
            let title_kek = key_set
                .title_kek(master_key_id)
                .map_err(|source| CliError::Nca {
                    source: NcaError::MissingKey { source },
                })?;
            reader.set_external_decryption_key(title_key.decrypt(title_kek));
        }
    }

    Ok(reader)
}

fn print_section(reader: &NcaReader, index: usize) {
    match NcaFsHeaderReader::new(reader, index) {
        Ok(header) => {
            println!(
                "  section {index}: {:?} hash={:?} encryption={:?} [{:#x}, {:#x})",
                header.get_fs_type(),
                header.get_hash_type(),
                header.get_encryption_type(),
                reader.get_fs_offset(index),
                reader.get_fs_end_offset(index),
            );
            if header.exists_sparse_layer() {
                println!("    sparse layer present");
            }
            if header.exists_compression_layer() {
                println!("    compression layer present");
            }
            if header.get_patch_info().has_indirect_table() {
                println!("    patch indirect table present");
            }
        }
        Err(e) => println!("  section {index}: unreadable ({e})"),
    }
}

fn nca_info(opts: InfoOpts, keys: Option<&PathBuf>) -> Result<(), CliError> {
    let reader = load_nca(&opts.nca, keys, None)?;

    println!("magic:            {}", String::from_utf8_lossy(&reader.get_magic()));
    println!("content type:     {:?}", reader.get_content_type());
    println!("distribution:     {:?}", reader.get_distribution_type());
    println!("program id:       {}", reader.get_program_id());
    println!("content size:     {:#x}", reader.get_content_size());
    println!("sdk version:      {:#010x}", reader.get_sdk_addon_version());
    println!("key generation:   {}", reader.get_key_generation());
    println!("rights id:        {}", reader.get_rights_id());
    println!("header sign1 ok:  {}", reader.get_header_sign1_valid());
    println!("sections:         {}", reader.get_fs_count());

    for index in 0..4 {
        if reader.has_fs_info(index) {
            print_section(&reader, index);
        }
    }

    Ok(())
}

fn nca_extract(opts: ExtractOpts, keys: Option<&PathBuf>) -> Result<(), CliError> {
    let reader = load_nca(&opts.nca, keys, opts.titlekey.as_deref())?;
    let driver = NcaFileSystemDriver::new(Arc::new(reader));

    let (storage, header) = if opts.raw {
        driver.open_raw_storage(opts.section).context(NcaSnafu)?
    } else {
        driver.open_storage(opts.section).context(NcaSnafu)?
    };

    info!(
        section = opts.section,
        fs_type = ?header.get_fs_type(),
        size = storage.get_size(),
        "extracting section"
    );

    storage.save_to_file(&opts.output).context(StorageSnafu)?;
    println!(
        "wrote {:#x} bytes to {}",
        storage.get_size(),
        opts.output.display()
    );

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let result = match opts.action {
        Action::Info(info_opts) => nca_info(info_opts, opts.keys.as_ref()),
        Action::Extract(extract_opts) => nca_extract(extract_opts, opts.keys.as_ref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        eprintln!("Caused by:");
        for cause in e.iter_chain().skip(1) {
            eprintln!(" - {}", cause);
        }
        std::process::exit(1);
    }
}
