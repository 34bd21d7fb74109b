use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::{ArgAction, Parser, ValueEnum};
use colored::Colorize;
use futures::future::join_all;
use log::{LevelFilter, info, warn};
use strum_macros::Display;
use tokio::sync::mpsc::{self, Sender};

use crate::{
    crypt::{
        Session,
        decrypt::{padding_oracle_decrypt, padding_oracle_decrypt_raw},
        forge::padding_oracle_forge,
        padding::{pad, strip},
    },
    errors::DecryptError,
    helper::{Config, Encoding, Messages, decode_ct, encode_ct, read_port_file},
    oracle::TcpOracle,
    print::{fmt_plaintext, progress_bar},
};

pub mod crypt;
pub mod errors;
pub mod helper;
pub mod oracle;
pub mod print;

#[derive(Display, Debug, Clone, ValueEnum)]
enum Block {
    SMALL,
    MED,
    LARGE,
}

impl Block {
    fn size(&self) -> usize {
        match self {
            Block::SMALL => 8,
            Block::MED => 16,
            Block::LARGE => 32,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "padbreak", version, about = "Recover CBC plaintext through a padding oracle")]
struct Args {
    ///ciphertext blocks C0 C1 [C2 ...], C0 being the IV or the block preceding C1.
    ///with --forge the last block is the seed of the forgery
    #[arg(num_args = 1.., required_unless_present = "forge")]
    blocks: Vec<String>,

    ///host of the oracle service
    #[arg(long, default_value = "localhost")]
    host: String,

    ///port of the oracle service, read from --port-file when absent
    #[arg(short, long)]
    port: Option<u16>,

    ///file whose first line holds the oracle port
    #[arg(long, default_value = "port")]
    port_file: PathBuf,

    ///the block size to use (small = 8) (med = 16) (large = 32)
    #[arg(short, long, ignore_case = true, default_value_t = Block::SMALL)]
    block_size: Block,

    ///the encoding of the blocks given on the command line and of forged output
    #[arg(short, long, ignore_case = true, default_value_t = Encoding::HEX)]
    encoding: Encoding,

    ///the number of concurrent oracle queries
    #[arg(short, long, default_value_t = 10)]
    threads: usize,

    ///number of times to retry an oracle query that failed or timed out
    #[arg(short, long, default_value_t = 5)]
    retry: usize,

    ///per query timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    ///reuse oracle connections instead of opening one per query
    #[arg(long)]
    keep_alive: bool,

    ///the plaintext to forge a ciphertext for, seeded by the last block or a random one
    #[arg(short, long)]
    forge: Option<String>,

    ///cross-check every recovered block against the dec_oracle command
    #[arg(long, conflicts_with = "forge")]
    verify: bool,

    ///print the plaintext without stripping its padding
    #[arg(long, conflicts_with = "forge")]
    raw: bool,

    ///do not draw the progress bar
    #[arg(long)]
    no_progress: bool,

    ///more logging, repeat for more detail
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn config_from_args(args: &Args) -> Config {
    Config {
        blk_size: args.block_size.size(),
        threads: args.threads,
        retry: args.retry,
        timeout: Duration::from_millis(args.timeout_ms),
        keep_alive: args.keep_alive,
    }
}

fn decode_blocks(args: &Args, blk_size: usize) -> Result<Vec<u8>, DecryptError> {
    let mut ct = vec![];
    for (i, block) in args.blocks.iter().enumerate() {
        let bytes = decode_ct(block, &args.encoding)?;
        if bytes.is_empty() || bytes.len() % blk_size != 0 {
            return Err(DecryptError::InvalidInput(format!(
                "argument {} decodes to {} bytes, not a whole number of {blk_size} byte blocks",
                i + 1,
                bytes.len()
            )));
        }
        ct.extend(bytes);
    }
    Ok(ct)
}

/// Last block of the positional arguments, random seed when none were given.
fn forge_seed(args: &Args, blk_size: usize) -> Result<Option<Vec<u8>>, DecryptError> {
    if args.blocks.is_empty() {
        return Ok(None);
    }
    let ct = decode_blocks(args, blk_size)?;
    Ok(ct.rchunks(blk_size).next().map(<[u8]>::to_vec))
}

/// Checks every recovered block against the service's answer, failing on the first mismatch.
fn compare_blocks(answers: &[Vec<u8>], plaintext: &[u8], blk_size: usize) -> Result<(), DecryptError> {
    let mut mismatch = None;
    for (i, (answer, recovered)) in answers.iter().zip(plaintext.chunks(blk_size)).enumerate() {
        if answer == recovered {
            info!("block {} matches dec_oracle", i + 1);
            continue;
        }
        warn!(
            "block {} differs from dec_oracle: recovered {}, service says {}",
            i + 1,
            hex::encode(recovered),
            hex::encode(answer)
        );
        mismatch.get_or_insert(DecryptError::VerificationMismatch {
            block: i + 1,
            recovered: hex::encode(recovered),
            reported: hex::encode(answer),
        });
    }
    match mismatch {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Compares each recovered block with what the service's `dec_oracle` reports.
async fn verify(
    oracle: &TcpOracle,
    ct: &[u8],
    plaintext: &[u8],
    blk_size: usize,
) -> Result<(), DecryptError> {
    let blocks: Vec<&[u8]> = ct.chunks(blk_size).collect();
    let answers = join_all(blocks.windows(2).map(|pair| oracle.dec_query(pair[0], pair[1])))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    compare_blocks(&answers, plaintext, blk_size)
}

async fn run(args: Args, tx: Option<Sender<Messages>>) -> Result<String, DecryptError> {
    let config = config_from_args(&args);
    let port = match args.port {
        Some(port) => port,
        None => read_port_file(&args.port_file)?,
    };
    let oracle = Arc::new(TcpOracle::new(&args.host, port, &config));
    let session = Session::new(oracle.clone(), &config)?;
    info!("attacking {}:{port} with {} byte blocks", args.host, config.blk_size);

    if let Some(forge) = &args.forge {
        let seed = forge_seed(&args, config.blk_size)?;
        let ct = padding_oracle_forge(forge.as_bytes(), seed.as_deref(), &session, tx).await?;
        return Ok(encode_ct(&ct, &args.encoding));
    }

    let ct = decode_blocks(&args, config.blk_size)?;
    if !(args.verify || args.raw) {
        return padding_oracle_decrypt(&ct, &session, tx)
            .await
            .map(|pt| fmt_plaintext(&pt));
    }
    let plaintext = padding_oracle_decrypt_raw(&ct, &session, tx).await?;
    if args.verify {
        verify(&oracle, &ct, &plaintext, config.blk_size).await?;
    }
    if args.raw {
        return Ok(fmt_plaintext(&plaintext));
    }
    strip(&plaintext, config.blk_size).map(|pt| fmt_plaintext(&pt))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let progress_len = match &args.forge {
        Some(pt) => pad(pt.as_bytes(), args.block_size.size()).len(),
        None => args
            .blocks
            .iter()
            .filter_map(|block| decode_ct(block, &args.encoding).ok())
            .map(|bytes| bytes.len())
            .sum::<usize>()
            .saturating_sub(args.block_size.size()),
    };
    let (tx, progress) = if args.no_progress {
        (None, None)
    } else {
        let (tx, rx) = mpsc::channel::<Messages>(255);
        (Some(tx), Some(progress_bar(progress_len, rx)))
    };

    let result = run(args, tx.clone()).await;
    if let Some(tx) = tx {
        let _ = tx.send(Messages::AttackComplete).await;
    }
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    match result {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(DecryptError::MalformedPadding {
            value,
            block_size,
            unstripped,
        }) => {
            eprintln!(
                "{}",
                format!("padding byte {value:#04x} is outside 1..={block_size}, printing unstripped plaintext")
                    .yellow()
            );
            println!("{}", fmt_plaintext(&unstripped));
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{}", e.to_string().red());
            ExitCode::FAILURE
        }
    }
}
