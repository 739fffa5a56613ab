use std::env;
use std::path::Path;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};

use threadline_storage::{
    MessageId, NewStream, SqliteStreamStore, StatusTransition, StorageError, StreamId,
    StreamRecordStore, StreamStatus, ThreadId, UserId, unix_timestamp_millis,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    SchemaInit,
    InterruptIdempotent,
    ResumeRace,
    ResumableOrder,
    RetentionPurge,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "schema_init" => Some(Self::SchemaInit),
            "interrupt_idempotent" => Some(Self::InterruptIdempotent),
            "resume_race" => Some(Self::ResumeRace),
            "resumable_order" => Some(Self::ResumableOrder),
            "retention_purge" => Some(Self::RetentionPurge),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::SchemaInit => "schema_init",
            Self::InterruptIdempotent => "interrupt_idempotent",
            Self::ResumeRace => "resume_race",
            Self::ResumableOrder => "resumable_order",
            Self::RetentionPurge => "retention_purge",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("resume worker task failed: {source}"))]
    WorkerJoin {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::InterruptIdempotent => {
            run_interrupt_idempotent(require_db_path(&args, "interrupt_idempotent")?).await
        }
        Scenario::ResumeRace => run_resume_race(require_db_path(&args, "resume_race")?).await,
        Scenario::ResumableOrder => {
            run_resumable_order(require_db_path(&args, "resumable_order")?).await
        }
        Scenario::RetentionPurge => {
            run_retention_purge(require_db_path(&args, "retention_purge")?).await
        }
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let id = StreamId::new_v7();
    let decoded = id
        .to_string()
        .parse::<StreamId>()
        .context(StorageValidationSnafu {
            stage: "scenario-id-roundtrip-parse",
        })?;

    if decoded != id {
        return ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip-compare",
            scenario: "id_roundtrip",
            reason: "stream id parse/format roundtrip mismatch".to_string(),
        }
        .fail();
    }

    let blank_rejected = matches!(
        MessageId::parse("  "),
        Err(StorageError::EmptyId { .. })
    );
    println!("stream_id_roundtrip=true");
    println!("blank_message_id_rejected={blank_rejected}");
    if !blank_rejected {
        return ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip-blank",
            scenario: "id_roundtrip",
            reason: "blank message id was accepted".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_interrupt_idempotent(path).await?;
        run_resume_race(path).await?;
        run_resumable_order(path).await?;
        run_retention_purge(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let store = open_store(db_path, "scenario-schema-init-open").await?;

    let discovered = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'stream_records'",
    )
    .fetch_optional(store.pool())
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let table_present = discovered.is_some();
    println!("stream_records_table={table_present}");
    if !table_present {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-verify",
            scenario: "schema_init",
            reason: "stream_records table missing after migrations".to_string(),
        }
        .fail();
    }

    // Reopening must be a no-op for already-applied migrations.
    drop(store);
    open_store(db_path, "scenario-schema-init-reopen").await?;
    println!("reopen_ok=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_interrupt_idempotent(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let store = open_store(db_path, "scenario-interrupt-open").await?;
    let record = insert(&store, "m-interrupt", "u-1").await?;

    let first = interrupt(&store, &record.message_id).await?;
    let second = interrupt(&store, &record.message_id).await?;
    let missing = interrupt(&store, &message_id("missing-id")?).await?;

    println!("first_updated={first}");
    println!("second_updated={second}");
    println!("missing_updated={missing}");

    if first < 1 || second != 0 || missing != 0 {
        return ScenarioFailedSnafu {
            stage: "scenario-interrupt-verify",
            scenario: "interrupt_idempotent",
            reason: format!("unexpected counts first={first} second={second} missing={missing}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_resume_race(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let store = Arc::new(open_store(db_path, "scenario-resume-race-open").await?);
    let record = insert(&store, "m-race", "u-1").await?;
    interrupt(&store, &record.message_id).await?;

    let stream_id = record.id;
    let workers = (0..2)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .transition_stream(
                        stream_id,
                        StatusTransition::single(StreamStatus::Paused, StreamStatus::Resumed),
                    )
                    .await
            })
        })
        .collect::<Vec<_>>();

    let mut winners = 0;
    for worker in workers {
        let applied = worker
            .await
            .context(WorkerJoinSnafu {
                stage: "scenario-resume-race-join",
            })?
            .context(StorageValidationSnafu {
                stage: "scenario-resume-race-transition",
            })?;
        if applied {
            winners += 1;
        }
    }

    println!("resume_winners={winners}");
    if winners != 1 {
        return ScenarioFailedSnafu {
            stage: "scenario-resume-race-verify",
            scenario: "resume_race",
            reason: format!("expected exactly one resume winner, saw {winners}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_resumable_order(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let store = open_store(db_path, "scenario-resumable-order-open").await?;

    let mut expected = Vec::new();
    for index in 0..3 {
        let record = insert(&store, &format!("m-order-{index}"), "u-order").await?;
        interrupt(&store, &record.message_id).await?;
        expected.push(record.id);
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
    }
    insert(&store, "m-order-foreign", "u-other").await?;
    expected.reverse();

    let listed = store
        .list_streams_by_status(user_id("u-order")?, StreamStatus::Paused)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-resumable-order-list",
        })?;
    let listed_ids = listed.iter().map(|record| record.id).collect::<Vec<_>>();

    let ordered = listed_ids == expected;
    println!("resumable_count={}", listed_ids.len());
    println!("resumable_newest_first={ordered}");
    if !ordered {
        return ScenarioFailedSnafu {
            stage: "scenario-resumable-order-verify",
            scenario: "resumable_order",
            reason: "paused streams were not listed newest first for the owner".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_retention_purge(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let store = open_store(db_path, "scenario-retention-open").await?;
    let finished = insert(&store, "m-finished", "u-1").await?;
    let paused = insert(&store, "m-paused", "u-1").await?;

    store
        .transition_stream(
            finished.id,
            StatusTransition::single(StreamStatus::Streaming, StreamStatus::Completed),
        )
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-retention-complete",
        })?;
    interrupt(&store, &paused.message_id).await?;

    let purged = store
        .purge_terminal_streams(unix_timestamp_millis() + 1)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-retention-purge",
        })?;
    let paused_survives = store
        .get_stream(paused.id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-retention-load-paused",
        })?
        .is_some();

    println!("purged={purged}");
    println!("paused_survives={paused_survives}");
    if purged != 1 || !paused_survives {
        return ScenarioFailedSnafu {
            stage: "scenario-retention-verify",
            scenario: "retention_purge",
            reason: format!("purged={purged} paused_survives={paused_survives}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn open_store(db_path: &str, stage: &'static str) -> RunnerResult<SqliteStreamStore> {
    SqliteStreamStore::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })
}

async fn insert(
    store: &SqliteStreamStore,
    message: &str,
    user: &str,
) -> RunnerResult<threadline_storage::StreamRecord> {
    store
        .insert_stream(NewStream {
            thread_id: ThreadId::parse("qa-thread").context(StorageValidationSnafu {
                stage: "scenario-insert-thread-id",
            })?,
            message_id: message_id(message)?,
            user_id: user_id(user)?,
        })
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-insert-stream",
        })
}

async fn interrupt(store: &SqliteStreamStore, message_id: &MessageId) -> RunnerResult<u64> {
    store
        .interrupt_streaming(message_id.clone())
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-interrupt-stream",
        })
}

fn message_id(raw: &str) -> RunnerResult<MessageId> {
    MessageId::parse(raw).context(StorageValidationSnafu {
        stage: "scenario-parse-message-id",
    })
}

fn user_id(raw: &str) -> RunnerResult<UserId> {
    UserId::parse(raw).context(StorageValidationSnafu {
        stage: "scenario-parse-user-id",
    })
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    remove_file_if_exists(Path::new(db_path), "scenario-reset-sqlite-db")?;
    let wal_path = format!("{db_path}-wal");
    remove_file_if_exists(Path::new(&wal_path), "scenario-reset-sqlite-wal")?;
    let shm_path = format!("{db_path}-shm");
    remove_file_if_exists(Path::new(&shm_path), "scenario-reset-sqlite-shm")?;
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunnerError::FileIo {
            stage,
            path: path.display().to_string(),
            source,
        }),
    }
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}
