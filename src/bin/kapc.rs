//! kapc: the clipboard/history companion CLI. A thin shell over the
//! library's store and engine APIs; argument-parsing polish
//! and help text are explicitly out of scope, so this stays close to the
//! minimum needed to exercise `copy`/`paste`/`search`/`delete`.

use std::io::{Read, Write};
use std::path::PathBuf;

use bytes::Bytes;
use clap::{Parser, Subcommand};

use kaprica::classifier;
use kaprica::config::{self, CliOverrides};
use kaprica::engine::Engine;
use kaprica::error::{KapricaError, Result};
use kaprica::model::{MAX_DATA_SIZE, MimePayload, SearchKind};
use kaprica::source::SourceBuffer;
use kaprica::store::Store;
use kaprica::transport::Transport;

#[derive(Parser, Debug)]
#[command(name = "kapc", version, about)]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Copy data to the Wayland clipboard.
    Copy {
        /// Text to copy; read from stdin if omitted.
        text: Vec<String>,
        /// Drop a single trailing newline before copying.
        #[arg(short = 'n', long = "trim-newline")]
        trim_newline: bool,
        /// Serve one paste request, then clear the selection.
        #[arg(short = 'o', long = "paste-once")]
        paste_once: bool,
        /// Clear the clipboard instead of copying.
        #[arg(short = 'c', long)]
        clear: bool,
        /// Copy a given history id to the clipboard instead of new data.
        #[arg(short = 'i', long = "id", value_name = "ID")]
        id: Option<i64>,
        /// Manually specify the MIME type to offer.
        #[arg(short = 't', long = "type")]
        mime_type: Option<String>,
        /// Look up a history entry by snippet and copy it.
        #[arg(short = 'r', long = "reverse-search", value_name = "SNIPPET")]
        reverse_search: Option<String>,
        #[arg(short = 'D', long)]
        database: Option<PathBuf>,
    },
    /// Retrieve contents from the Wayland clipboard or history.
    Paste {
        /// List the offered MIME types instead of pasting.
        #[arg(short = 'l', long = "list-types")]
        list_types: bool,
        /// Don't append a trailing newline.
        #[arg(short = 'n', long = "no-newline")]
        no_newline: bool,
        /// Paste a given history id instead of the live selection.
        #[arg(short = 'i', long = "id", value_name = "ID")]
        id: Option<i64>,
        /// Manually specify which MIME type to paste.
        #[arg(short = 't', long = "type")]
        mime_type: Option<String>,
        #[arg(short = 'D', long)]
        database: Option<PathBuf>,
    },
    /// Search through the history database.
    Search {
        /// Pattern to search for; omit to list the most recent entries.
        pattern: Option<String>,
        /// Limit the number of entries returned.
        #[arg(short = 'l', long)]
        limit: Option<u32>,
        /// Show only the ids of the entries found.
        #[arg(short = 'i', long = "id")]
        ids_only: bool,
        /// Show only the snippets of the entries found.
        #[arg(short = 's', long)]
        snippets_only: bool,
        /// Search by MIME type instead of payload content.
        #[arg(short = 't', long = "type")]
        by_mime_type: bool,
        /// Search by shell-style glob instead of plain substring.
        #[arg(short = 'g', long)]
        glob: bool,
        /// Machine-readable `id<TAB>snippet` output.
        #[arg(short = 'L', long)]
        list: bool,
        #[arg(short = 'D', long)]
        database: Option<PathBuf>,
    },
    /// Delete entries from the history database.
    Delete {
        /// Pattern to match entries for deletion.
        pattern: Option<String>,
        /// One or more history ids to delete directly.
        #[arg(short = 'i', long = "id", value_name = "ID")]
        ids: Vec<i64>,
        /// Limit the number of entries deleted.
        #[arg(short = 'l', long)]
        limit: Option<u32>,
        /// Delete by MIME type instead of payload content.
        #[arg(short = 't', long = "type")]
        by_mime_type: bool,
        /// Delete by shell-style glob instead of plain substring.
        #[arg(short = 'g', long)]
        glob: bool,
        /// Don't ask for confirmation.
        #[arg(short = 'a', long)]
        accept: bool,
        #[arg(short = 'D', long)]
        database: Option<PathBuf>,
    },
}

fn resolve_database(explicit: &Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.clone());
    }
    Ok(config::load(&CliOverrides::default())?.database_path)
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("kapc: {message}");
    std::process::exit(1);
}

fn run_copy(
    text: Vec<String>,
    trim_newline: bool,
    paste_once: bool,
    clear: bool,
    id: Option<i64>,
    mime_type: Option<String>,
    reverse_search: Option<String>,
    database: Option<PathBuf>,
) -> Result<()> {
    let mut transport = Transport::connect()?;

    if clear {
        transport.clear_selection();
        return transport.flush();
    }

    let mut store = Store::open(&resolve_database(&database)?)?;
    let mut source = SourceBuffer::new();

    if let Some(id) = id {
        if !store.get_entry(id, &mut source)? {
            fail(format_args!("no entry with id {id}"));
        }
    } else if let Some(snippet) = reverse_search {
        let found = store.find_entry_from_snippet(&snippet)?;
        if found == 0 || !store.get_entry(found, &mut source)? {
            fail(format_args!("no entry matching {snippet:?}"));
        }
    } else {
        let mut bytes = if text.is_empty() {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .map_err(KapricaError::Io)?;
            buf
        } else {
            text.join(" ").into_bytes()
        };
        if trim_newline && bytes.last() == Some(&b'\n') {
            bytes.pop();
        }
        if bytes.len() as u64 > MAX_DATA_SIZE {
            fail("data is too large to copy");
        }
        let mime = mime_type.unwrap_or_else(|| classifier::find_exact_type(&bytes).to_string());
        source.fill_from_payloads(vec![MimePayload::new(mime, Bytes::from(bytes))]);
    }

    source.offer_once = paste_once;
    transport.set_selection(&source.payloads, source.offer_once)?;
    transport.flush()?;

    // Serve until another client takes the selection (or, for a one-shot
    // source, until the first successful send clears it from inside the
    // send callback).
    while transport.is_serving() {
        let mut fds = [libc::pollfd {
            fd: transport.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, -1) };
        if ret < 0 {
            return Err(KapricaError::Io(std::io::Error::last_os_error()));
        }
        transport.read_events()?;
    }
    Ok(())
}

fn write_payload(payload: &MimePayload, no_newline: bool) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    out.write_all(&payload.bytes).map_err(KapricaError::Io)?;
    if !no_newline && !payload.bytes.ends_with(b"\n") {
        out.write_all(b"\n").map_err(KapricaError::Io)?;
    }
    Ok(())
}

fn output_source(source: &SourceBuffer, list_types: bool, no_newline: bool, mime_type: Option<&str>) -> Result<()> {
    if list_types {
        for payload in &source.payloads {
            println!("{}", payload.mime_type);
        }
        return Ok(());
    }

    let payload = match mime_type {
        Some(mime_type) => source.payload_for(mime_type),
        None => classifier::find_write_type(&source.payloads).map(|i| &source.payloads[i]),
    };

    match payload {
        Some(payload) => write_payload(payload, no_newline),
        None => fail("no matching clipboard payload"),
    }
}

fn run_paste(
    list_types: bool,
    no_newline: bool,
    id: Option<i64>,
    mime_type: Option<String>,
    database: Option<PathBuf>,
) -> Result<()> {
    if let Some(id) = id {
        let store = Store::open(&resolve_database(&database)?)?;
        let mut source = SourceBuffer::new();
        if !store.get_entry(id, &mut source)? {
            fail(format_args!("no entry with id {id}"));
        }
        return output_source(&source, list_types, no_newline, mime_type.as_deref());
    }

    let mut engine = Engine::init()?;
    if !engine.capture_live_selection()? {
        fail("no clipboard contents available");
    }
    output_source(engine.source(), list_types, no_newline, mime_type.as_deref())
}

fn search_kind(by_mime_type: bool, glob: bool) -> SearchKind {
    if glob {
        SearchKind::Glob
    } else if by_mime_type {
        SearchKind::MimeType
    } else {
        SearchKind::Content
    }
}

fn run_search(
    pattern: Option<String>,
    limit: Option<u32>,
    ids_only: bool,
    snippets_only: bool,
    by_mime_type: bool,
    glob: bool,
    list: bool,
    database: Option<PathBuf>,
) -> Result<()> {
    let store = Store::open(&resolve_database(&database)?)?;
    let limit = limit.unwrap_or(u32::MAX);

    let ids = match pattern {
        Some(pattern) => {
            store.find_matching_entries(pattern.as_bytes(), limit, search_kind(by_mime_type, glob))?
        }
        None => store.get_latest_entries(limit, 0)?,
    };

    for id in ids {
        if ids_only {
            println!("{id}");
            continue;
        }
        let snippet = store.get_snippet(id)?.unwrap_or_default();
        if snippets_only {
            println!("{snippet}");
        } else if list {
            println!("{id}\t{snippet}");
        } else {
            println!("{id}: {snippet}");
        }
    }
    Ok(())
}

fn run_delete(
    pattern: Option<String>,
    ids: Vec<i64>,
    limit: Option<u32>,
    by_mime_type: bool,
    glob: bool,
    accept: bool,
    database: Option<PathBuf>,
) -> Result<()> {
    let store = Store::open(&resolve_database(&database)?)?;

    let targets = if !ids.is_empty() {
        ids
    } else if let Some(pattern) = pattern {
        store.find_matching_entries(
            pattern.as_bytes(),
            limit.unwrap_or(u32::MAX),
            search_kind(by_mime_type, glob),
        )?
    } else {
        fail("delete requires --id or a search pattern");
    };

    if targets.is_empty() {
        println!("No matching entries");
        return Ok(());
    }

    if !accept {
        eprint!("Delete {} entries? [y/N] ", targets.len());
        std::io::stderr().flush().ok();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer).map_err(KapricaError::Io)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted");
            return Ok(());
        }
    }

    for id in &targets {
        store.delete_entry(*id)?;
    }
    println!("Deleted {} entries", targets.len());
    Ok(())
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        CliCommand::Copy {
            text,
            trim_newline,
            paste_once,
            clear,
            id,
            mime_type,
            reverse_search,
            database,
        } => run_copy(text, trim_newline, paste_once, clear, id, mime_type, reverse_search, database),
        CliCommand::Paste { list_types, no_newline, id, mime_type, database } => {
            run_paste(list_types, no_newline, id, mime_type, database)
        }
        CliCommand::Search {
            pattern,
            limit,
            ids_only,
            snippets_only,
            by_mime_type,
            glob,
            list,
            database,
        } => run_search(pattern, limit, ids_only, snippets_only, by_mime_type, glob, list, database),
        CliCommand::Delete { pattern, ids, limit, by_mime_type, glob, accept, database } => {
            run_delete(pattern, ids, limit, by_mime_type, glob, accept, database)
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(e) = run() {
        fail(e);
    }
}
