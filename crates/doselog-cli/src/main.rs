use std::fs;
use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use doselog_api::{mirror_from_env, Journal};
use doselog_core::{
    FormSession, QuestionDef, QuestionKind, SlotStorage, DEFAULT_SERIES_WINDOW,
};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "doselog")]
#[command(about = "Local-first microdosing journal")]
struct Cli {
    #[arg(long, default_value = "./doselog.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Entry {
        #[command(subcommand)]
        command: EntryCommand,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Series(SeriesArgs),
    Export {
        #[command(subcommand)]
        command: ExportCommand,
    },
    Import {
        #[command(subcommand)]
        command: ImportCommand,
    },
}

#[derive(Debug, Subcommand)]
enum EntryCommand {
    /// Fill the questionnaire interactively on stdin.
    New,
    /// Record an entry non-interactively from KEY=VALUE pairs.
    Add(EntryAddArgs),
    List,
    Delete(EntryDeleteArgs),
}

#[derive(Debug, Args)]
struct EntryAddArgs {
    #[arg(long = "field", value_name = "KEY=VALUE")]
    fields: Vec<String>,
}

#[derive(Debug, Args)]
struct EntryDeleteArgs {
    #[arg(long)]
    id: String,
    /// Skip the confirmation prompt.
    #[arg(long, default_value_t = false)]
    yes: bool,
}

#[derive(Debug, Subcommand)]
enum SchemaCommand {
    Show,
    /// Replace the questionnaire with the JSON question sequence in a file.
    Edit(SchemaEditArgs),
    /// Restore the built-in questionnaire.
    Reset,
}

#[derive(Debug, Args)]
struct SchemaEditArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct SeriesArgs {
    #[arg(long, default_value_t = DEFAULT_SERIES_WINDOW)]
    window: usize,
}

#[derive(Debug, Subcommand)]
enum ExportCommand {
    Csv(ExportArgs),
    Json(ExportArgs),
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Write to a file instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum ImportCommand {
    Json(ImportArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

fn emit_json(value: Value) -> Result<()> {
    let mut tagged = serde_json::Map::new();
    tagged.insert(
        "contract_version".to_string(),
        Value::String(CLI_CONTRACT_VERSION.to_string()),
    );
    match value {
        Value::Object(fields) => tagged.extend(fields),
        other => {
            tagged.insert("payload".to_string(), other);
        }
    }
    println!("{}", serde_json::to_string_pretty(&Value::Object(tagged))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut journal = Journal::open(&cli.db)?.with_mirror(mirror_from_env());

    match cli.command {
        Command::Entry { command } => run_entry(command, &mut journal),
        Command::Schema { command } => run_schema(command, &mut journal),
        Command::Series(args) => run_series(&args, &journal),
        Command::Export { command } => run_export(command, &journal),
        Command::Import { command } => run_import(command, &mut journal),
    }
}

fn run_entry<S: SlotStorage>(command: EntryCommand, journal: &mut Journal<S>) -> Result<()> {
    match command {
        EntryCommand::New => {
            let schema = journal.schema()?;
            let stdin = std::io::stdin();
            let session = fill_session(journal, &schema, &mut stdin.lock().lines())?;
            let (entry, _fresh) = journal.submit(&session)?;
            emit_json(serde_json::to_value(&entry).context("failed to serialize entry")?)
        }
        EntryCommand::Add(args) => {
            let mut session = journal.new_session()?;
            for raw in &args.fields {
                let (key, value) = parse_field(raw)?;
                session.set(&key, value);
            }
            let (entry, _fresh) = journal.submit(&session)?;
            emit_json(serde_json::to_value(&entry).context("failed to serialize entry")?)
        }
        EntryCommand::List => {
            let entries = journal.entries()?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
        EntryCommand::Delete(args) => {
            if !args.yes && !confirm_delete(&args.id)? {
                return emit_json(serde_json::json!({
                    "id": args.id,
                    "deleted": false,
                    "aborted": true
                }));
            }

            let deleted = journal.delete(&args.id)?;
            emit_json(serde_json::json!({ "id": args.id, "deleted": deleted }))
        }
    }
}

fn run_schema<S: SlotStorage>(command: SchemaCommand, journal: &mut Journal<S>) -> Result<()> {
    match command {
        SchemaCommand::Show => {
            let questions = journal.schema()?;
            emit_json(serde_json::json!({ "questions": questions }))
        }
        SchemaCommand::Edit(args) => {
            let raw = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read schema file {}", args.file.display()))?;
            let questions = journal.save_schema_raw(&raw)?;
            emit_json(serde_json::json!({ "questions": questions, "saved": true }))
        }
        SchemaCommand::Reset => {
            let questions = journal.reset_schema()?;
            emit_json(serde_json::json!({ "questions": questions, "saved": true }))
        }
    }
}

fn run_series<S: SlotStorage>(args: &SeriesArgs, journal: &Journal<S>) -> Result<()> {
    let points = journal.series(args.window)?;
    emit_json(serde_json::json!({ "window": args.window, "points": points }))
}

fn run_export<S: SlotStorage>(command: ExportCommand, journal: &Journal<S>) -> Result<()> {
    match command {
        ExportCommand::Csv(args) => {
            let body = journal.export_csv()?;
            write_export("csv", &body, args.out.as_deref(), journal)
        }
        ExportCommand::Json(args) => {
            let body = journal.export_json()?;
            write_export("json", &body, args.out.as_deref(), journal)
        }
    }
}

fn write_export<S: SlotStorage>(
    format: &str,
    body: &str,
    out: Option<&std::path::Path>,
    journal: &Journal<S>,
) -> Result<()> {
    match out {
        Some(path) => {
            fs::write(path, body)
                .with_context(|| format!("failed to write export file {}", path.display()))?;
            emit_json(serde_json::json!({
                "format": format,
                "out": path,
                "entries": journal.entries()?.len()
            }))
        }
        None => {
            print!("{body}");
            Ok(())
        }
    }
}

fn run_import<S: SlotStorage>(command: ImportCommand, journal: &mut Journal<S>) -> Result<()> {
    match command {
        ImportCommand::Json(args) => {
            let raw = fs::read_to_string(&args.input)
                .with_context(|| format!("failed to read import file {}", args.input.display()))?;
            let imported = journal.import_json(&raw)?;
            emit_json(serde_json::json!({ "in": args.input, "imported": imported }))
        }
    }
}

fn fill_session<S: SlotStorage, L>(
    journal: &Journal<S>,
    schema: &[QuestionDef],
    lines: &mut L,
) -> Result<FormSession>
where
    L: Iterator<Item = std::io::Result<String>>,
{
    let mut session = journal.new_session()?;
    for question in schema {
        eprint!("{}: ", prompt_for(question));
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("failed to read stdin")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            // Blank input keeps the schema default for this question.
            continue;
        }
        session.set(&question.key, coerce_input(&question.kind, trimmed));
    }
    Ok(session)
}

fn prompt_for(question: &QuestionDef) -> String {
    match &question.kind {
        QuestionKind::Range { min, max, .. } => {
            format!("{} [{}-{}]", question.label, min.unwrap_or(0.0), max.unwrap_or(10.0))
        }
        QuestionKind::Select { options } if !options.is_empty() => {
            format!("{} ({})", question.label, options.join("/"))
        }
        _ => question.label.clone(),
    }
}

fn coerce_input(kind: &QuestionKind, raw: &str) -> Value {
    match kind {
        QuestionKind::Number { .. } | QuestionKind::Range { .. } => coerce_scalar(raw),
        _ => Value::String(raw.to_string()),
    }
}

fn parse_field(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(anyhow!("field must be KEY=VALUE: {raw}"));
    };
    Ok((key.to_string(), coerce_scalar(value)))
}

fn coerce_scalar(raw: &str) -> Value {
    if let Ok(int) = raw.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}

fn confirm_delete(id: &str) -> Result<bool> {
    eprint!("delete entry {id}? [y/N] ");
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read confirmation")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
