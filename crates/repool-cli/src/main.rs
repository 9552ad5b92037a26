//! `sqlrun` — issue a file of SQL statements through a configured
//! connection pool.
//!
//! Statements are separated by newlines, or by an explicit separator
//! string. Lines starting with `#` or `--` are comments. Each success
//! prints `.`, each failure prints `x`; failed statements and their
//! error messages are appended to `SQLUpdate.log`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use repool_db::{DbError, PoolManager};

/// Name of the file failed statements are appended to.
const FAILURE_LOG: &str = "SQLUpdate.log";

#[derive(Parser)]
#[command(name = "sqlrun", about = "Send a file of SQL statements to a pooled database")]
struct Args {
    /// Pool-manager configuration file (TOML).
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Name of the pool to draw the connection from.
    pool: String,

    /// File of SQL statements to execute.
    script: PathBuf,

    /// Statement separator; statements are split on newlines when
    /// omitted.
    #[arg(long)]
    separator: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok((succeeded, failed)) => {
            println!();
            println!("{succeeded} succeeded, {failed} failed");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("sqlrun: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(usize, usize), DbError> {
    // The in-memory driver ships with the tool so `memory:` URLs work
    // for smoke runs; real drivers register themselves at startup.
    repool_db::testing::memory_driver();

    let script = fs::read_to_string(&args.script)?;
    let statements = split_statements(&script, args.separator.as_deref());

    let manager = PoolManager::from_file(&args.config)?;
    let result = execute_all(&manager, &args.pool, &statements, Path::new(FAILURE_LOG));
    manager.release();
    result
}

fn execute_all(
    manager: &PoolManager,
    pool: &str,
    statements: &[String],
    failure_log: &Path,
) -> Result<(usize, usize), DbError> {
    let connection = manager
        .connection(pool)?
        .ok_or_else(|| DbError::driver(format!("no connection available from pool '{pool}'")))?;
    let statement = connection.create_statement()?;

    let mut succeeded = 0usize;
    let mut failures: Vec<(String, DbError)> = Vec::new();
    let mut stdout = std::io::stdout();
    for sql in statements {
        match statement.execute(sql) {
            Ok(_) => {
                succeeded += 1;
                print!(".");
            }
            Err(error) => {
                print!("x");
                failures.push((sql.clone(), error));
            }
        }
        let _ = stdout.flush();
    }

    statement.close()?;
    connection.close()?;

    let failed = failures.len();
    if !failures.is_empty() {
        if let Err(error) = append_failures(failure_log, &failures) {
            tracing::warn!(%error, log = %failure_log.display(), "unable to write failure log");
        }
    }
    Ok((succeeded, failed))
}

/// Split a script into statements, dropping blanks and comment lines
/// (`#` or `--`).
fn split_statements(script: &str, separator: Option<&str>) -> Vec<String> {
    let pieces: Vec<&str> = match separator {
        Some(separator) if !separator.is_empty() => script.split(separator).collect(),
        _ => script.lines().collect(),
    };
    pieces
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with('#') && !s.starts_with("--"))
        .map(str::to_owned)
        .collect()
}

fn append_failures(failure_log: &Path, failures: &[(String, DbError)]) -> std::io::Result<()> {
    let mut log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(failure_log)?;
    for (sql, error) in failures {
        writeln!(log)?;
        writeln!(log, "{sql}")?;
        writeln!(log, "{error}")?;
    }
    Ok(())
}
