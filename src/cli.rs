use std::error::Error;
use std::fs;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use atty::Stream;
use clap::{Parser, Subcommand};
use sidecar_rs::popup::PopupView;
use sidecar_rs::render::line_markdown;
use sidecar_rs::store::EXPORT_FILENAME;
use sidecar_rs::{AnySource, FlashcardRecord, ReaderConfig, ReaderSession, RenderedLine};
use termimad::{FmtText, MadSkin, terminal_size};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sidecar-rs",
    about = "Read furigana-annotated documents and manage flashcards",
    version
)]
pub struct Cli {
    /// Emit JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Content server base URL, or a directory laid out like its sidecar tree.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    content: String,

    /// Annotation store log.
    #[arg(long, global = true, default_value = "sidecar.jsonl")]
    store: PathBuf,

    /// Keep annotations in memory only.
    #[arg(long, global = true)]
    in_memory: bool,

    /// Maximum number of line payloads kept in memory.
    #[arg(long, global = true)]
    cache_capacity: Option<NonZeroUsize>,

    /// Content request timeout in seconds.
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a document with overrides applied and flashcards in bold.
    Render {
        /// Document file name, e.g. `story.md` or `story.json`.
        doc: String,
    },
    /// List a document's flashcards in reading order.
    Flashcards { doc: String },
    /// Show the dictionary hits of one morpheme.
    Lookup {
        doc: String,
        /// Zero-based line number in the document.
        line: usize,
        /// Zero-based morpheme index in the line.
        morpheme: usize,
    },
    /// Tag a dictionary hit at a morpheme, or untag it if already tagged there.
    Tag {
        doc: String,
        line: usize,
        morpheme: usize,
        /// Hit group, as numbered by `lookup`.
        #[arg(long, default_value_t = 0)]
        group: usize,
        /// Hit within the group.
        #[arg(long, default_value_t = 0)]
        position: usize,
    },
    /// Replace the readings of a morpheme's ruby segments, in order.
    Furigana {
        doc: String,
        line: usize,
        morpheme: usize,
        readings: Vec<String>,
        /// Drop the override instead, restoring the generated furigana.
        #[arg(long, conflicts_with = "readings")]
        remove: bool,
    },
    /// Write every stored record to a file.
    Export {
        #[arg(short, long, default_value = EXPORT_FILENAME)]
        output: PathBuf,
    },
    /// Run the HTTP front end (requires the `web` feature).
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        /// Publish this directory under the sidecar mount.
        #[arg(long)]
        serve_dir: Option<PathBuf>,
    },
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(cli))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

impl Cli {
    fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            content: self.content.clone(),
            store_path: (!self.in_memory).then(|| self.store.clone()),
            dict_cache_capacity: self.cache_capacity,
            request_timeout: Duration::from_secs(self.timeout),
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = cli.reader_config();
    match cli.command {
        Command::Serve { addr, serve_dir } => serve(config, addr, serve_dir).await,
        Command::Export { output } => {
            let session = config.build_session()?;
            let export = session.export();
            fs::write(&output, serde_json::to_vec_pretty(&export)?)?;
            println!("Exported {} records to {}", export.total_rows, output.display());
            Ok(())
        }
        Command::Render { doc } => {
            let session = open(&config, &doc).await?;
            let lines = session
                .render()
                .ok_or_else(|| format!("Document {doc:?} is unavailable"))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&lines)?);
            } else {
                print_document(&lines);
            }
            Ok(())
        }
        Command::Flashcards { doc } => {
            let session = open(&config, &doc).await?;
            let records = session.flashcard_list();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_flashcards(&doc, &records);
            }
            Ok(())
        }
        Command::Lookup {
            doc,
            line,
            morpheme,
        } => {
            let session = open(&config, &doc).await?;
            session.click_displayed(line, morpheme).await?;
            let view = session
                .popup_view()?
                .ok_or("The selection was superseded")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_popup(&view);
            }
            Ok(())
        }
        Command::Tag {
            doc,
            line,
            morpheme,
            group,
            position,
        } => {
            let session = open(&config, &doc).await?;
            session.click_displayed(line, morpheme).await?;
            let hit = session
                .hit_at(group, position)
                .ok_or_else(|| format!("No dictionary hit at group {group} position {position}"))?;
            let toggled = session.toggle_flashcard(&hit)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&toggled.record)?);
            } else {
                let action = if toggled.added { "Tagged" } else { "Untagged" };
                println!(
                    "{action} {} ({}) at line {line}, morpheme {morpheme}",
                    hit.word_id, hit.summary
                );
            }
            Ok(())
        }
        Command::Furigana {
            doc,
            line,
            morpheme,
            readings,
            remove,
        } => {
            let session = open(&config, &doc).await?;
            session.click_displayed(line, morpheme).await?;
            let record = if remove {
                session.remove_override()?
            } else {
                session.begin_edit()?;
                for (index, reading) in readings.into_iter().enumerate() {
                    session.set_reading(index, reading)?;
                }
                session.save_edit()?
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!(
                    "Line {} now has {} furigana override(s)",
                    record.line_hash,
                    record.overrides.len()
                );
            }
            Ok(())
        }
    }
}

#[cfg(feature = "web")]
async fn serve(
    reader: ReaderConfig,
    addr: SocketAddr,
    content_root: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let config = sidecar_rs::web::WebConfig {
        addr,
        reader,
        content_root,
    };
    sidecar_rs::web::serve(config).await?;
    Ok(())
}

#[cfg(not(feature = "web"))]
async fn serve(
    _reader: ReaderConfig,
    _addr: SocketAddr,
    _content_root: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    Err("The HTTP front end is disabled. Rebuild with `--features web` to enable it.".into())
}

async fn open(config: &ReaderConfig, doc: &str) -> Result<ReaderSession<AnySource>, Box<dyn Error>> {
    let session = config.build_session()?;
    session.open_document(doc).await?;
    Ok(session)
}

fn print_document(lines: &[RenderedLine]) {
    let mut body = String::new();
    for line in lines {
        body.push_str(&line_markdown(line));
        body.push('\n');
        if let RenderedLine::Annotated { summaries, .. } = line {
            for summary in summaries {
                body.push_str("* ");
                body.push_str(summary);
                body.push('\n');
            }
        }
    }
    render_markdown(&body);
}

fn print_flashcards(doc: &str, records: &[FlashcardRecord]) {
    if records.is_empty() {
        println!("No flashcards in {doc}.");
        return;
    }
    let width = records
        .iter()
        .map(|record| record.word_id.len())
        .max()
        .unwrap_or(0)
        .max("WORD_ID".len());
    println!("{:<width$}  {:>5}  {}", "WORD_ID", "TAGS", "SUMMARY", width = width);
    println!("{:-<width$}  {:->5}  {}", "", "", "-------", width = width);
    for record in records {
        println!(
            "{:<width$}  {:>5}  {}",
            record.word_id,
            record.location_count(doc),
            record.summary,
            width = width
        );
    }
}

fn print_popup(view: &PopupView) {
    println!(
        "Line {} morpheme {} ({})",
        view.location.line_number,
        view.location.morpheme_idx,
        sidecar_rs::render::inline_ruby(&view.location.furigana)
    );
    if view.hits.is_empty() {
        println!("No dictionary hits.");
        return;
    }
    for (group_idx, group) in view.hits.iter().enumerate() {
        for (position, hit) in group.iter().enumerate() {
            let summary: String = hit
                .highlight
                .iter()
                .map(|span| {
                    if span.highlighted {
                        format!("**{}**", span.text)
                    } else {
                        span.text.clone()
                    }
                })
                .collect();
            println!("- [{group_idx}.{position}] {}", hit.action_label());
            render_markdown(&format!("  {summary}"));
        }
    }
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn render_markdown(body: &str) {
    let trimmed = body.trim_end();
    if trimmed.is_empty() {
        return;
    }
    if stdout_is_tty() {
        let skin = MadSkin::default();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        println!("{formatted}");
    } else {
        println!("{trimmed}");
    }
}
