mod display;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use docstore::{SortSpec, Store, StoreConfig, Strictness, UpdateOptions, WriteMode};

#[derive(Parser)]
#[command(name = "docstore", about = "Inspect and edit a docstore data directory")]
struct Cli {
    /// Data directory (defaults to $DOCSTORE_DATA_DIR, then ./data)
    #[arg(long)]
    data: Option<PathBuf>,

    /// Write mode: overwrite | atomic
    #[arg(long)]
    write_mode: Option<String>,

    /// Reject unknown operators and stages instead of ignoring them
    #[arg(long)]
    strict: bool,

    /// Output raw JSON (no pretty-printing)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List collections in the data directory
    Collections,
    /// Print every document matching a query
    Find {
        collection: String,
        #[arg(default_value = "{}")]
        query: String,
        /// Sort spec, e.g. '{"createdAt": -1}'
        #[arg(long)]
        sort: Option<String>,
        /// Field list, e.g. "name email" or "-password"
        #[arg(long)]
        select: Option<String>,
        #[arg(long)]
        skip: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the first document matching a query
    FindOne {
        collection: String,
        #[arg(default_value = "{}")]
        query: String,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        select: Option<String>,
    },
    /// Print a document by _id
    Get { collection: String, id: String },
    /// Count documents matching a query
    Count {
        collection: String,
        #[arg(default_value = "{}")]
        query: String,
    },
    /// Insert a document (or an array of documents)
    Insert { collection: String, document: String },
    /// Update the first document matching a query
    Update {
        collection: String,
        query: String,
        update: String,
        /// Insert a document seeded from the query when nothing matches
        #[arg(long)]
        upsert: bool,
    },
    /// Run an aggregation pipeline
    Aggregate { collection: String, pipeline: String },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let store = match open_store(&cli) {
        Ok(store) => store,
        Err(e) => fail(&e),
    };
    match run(&store, cli.command, cli.json) {
        Ok(output) => println!("{output}"),
        Err(e) => fail(&e),
    }
}

fn fail(err: &dyn std::fmt::Display) -> ! {
    eprintln!("{}", display::format_error(err));
    std::process::exit(1);
}

fn open_store(cli: &Cli) -> docstore::Result<Store> {
    let mut config = StoreConfig::from_env()?;
    if let Some(data) = &cli.data {
        config.data_dir = data.clone();
    }
    if let Some(mode) = &cli.write_mode {
        config = config.write_mode(WriteMode::parse(mode)?);
    }
    if cli.strict {
        config = config.strictness(Strictness::Strict);
    }
    log::debug!("data directory {}", config.data_dir.display());
    Store::open(config)
}

fn parse_json(label: &str, text: &str) -> docstore::Result<Value> {
    serde_json::from_str(text).map_err(|e| {
        log::debug!("bad {label} argument: {text}");
        docstore::Error::Json(e)
    })
}

fn parse_sort(store: &Store, text: Option<&str>) -> docstore::Result<SortSpec> {
    match text {
        Some(text) => SortSpec::parse_with(&parse_json("sort", text)?, store.config().strictness),
        None => Ok(SortSpec::new()),
    }
}

fn run(store: &Store, command: Command, raw_json: bool) -> docstore::Result<String> {
    let output = match command {
        Command::Collections => {
            let names = store.list_collections()?;
            display::format_scalar(Value::from(names), raw_json)
        }
        Command::Find {
            collection,
            query,
            sort,
            select,
            skip,
            limit,
        } => {
            let mut find = store
                .collection(&collection)?
                .find(parse_json("query", &query)?)
                .sort(parse_sort(store, sort.as_deref())?);
            if let Some(fields) = &select {
                find = find.select(fields);
            }
            if let Some(n) = skip {
                find = find.skip(n);
            }
            if let Some(n) = limit {
                find = find.limit(n);
            }
            display::format_documents(find.exec()?, raw_json)
        }
        Command::FindOne {
            collection,
            query,
            sort,
            select,
        } => {
            let mut find = store
                .collection(&collection)?
                .find_one(parse_json("query", &query)?)
                .sort(parse_sort(store, sort.as_deref())?);
            if let Some(fields) = &select {
                find = find.select(fields);
            }
            display::format_document(find.exec()?, raw_json)
        }
        Command::Get { collection, id } => {
            display::format_document(store.collection(&collection)?.find_by_id(&id), raw_json)
        }
        Command::Count { collection, query } => {
            let n = store
                .collection(&collection)?
                .count_documents(&parse_json("query", &query)?)?;
            display::format_scalar(Value::from(n), raw_json)
        }
        Command::Insert {
            collection,
            document,
        } => {
            let col = store.collection(&collection)?;
            match parse_json("document", &document)? {
                Value::Array(items) => display::format_documents(col.create_many(items)?, raw_json),
                single => display::format_document(Some(col.create(single)?), raw_json),
            }
        }
        Command::Update {
            collection,
            query,
            update,
            upsert,
        } => {
            let options = UpdateOptions {
                upsert,
                ..UpdateOptions::default()
            };
            let doc = store.collection(&collection)?.find_one_and_update(
                &parse_json("query", &query)?,
                &parse_json("update", &update)?,
                options,
            )?;
            display::format_document(doc, raw_json)
        }
        Command::Aggregate {
            collection,
            pipeline,
        } => {
            let docs = store
                .collection(&collection)?
                .aggregate(&parse_json("pipeline", &pipeline)?)?;
            display::format_documents(docs, raw_json)
        }
    };
    Ok(output)
}
