//! Database helper stage
//!
//! Same isolation pattern as the file helper: blocking database calls run
//! on a dedicated pool and completions travel back to the issuing stage
//! with the issuer's continuation token. The concrete client is an external
//! collaborator supplied through the [`DbClient`] trait.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::domain_types::{QueueCapacity, WorkerCount};
use crate::eds::event::StageEvent;
use crate::eds::helpers::file_io::ContinuationToken;
use crate::eds::job::Job;
use crate::eds::queue::QueueError;
use crate::eds::stage::{EventHandler, EventHandlerFactory, Stage};

/// Errors a database client may report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("statement failed: {0}")]
    Statement(String),
}

/// A result set returned by a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Blocking database client interface. Implementations may block freely;
/// they only ever run on the helper stage's own workers.
pub trait DbClient: Send + Sync {
    fn query(&self, statement: &str) -> Result<DbRows, DbError>;
    fn execute(&self, statement: &str) -> Result<u64, DbError>;
}

/// Successful result of a database operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbOutcome {
    Rows(DbRows),
    Affected(u64),
}

/// Receives database completions on behalf of the issuing stage.
pub trait DbCompletionSink: Send + Sync {
    fn db_complete(
        &self,
        job: Arc<dyn Job>,
        token: ContinuationToken,
        result: Result<DbOutcome, DbError>,
    );
}

/// Events accepted by the database helper stage.
pub enum DbEvent {
    Query {
        job: Arc<dyn Job>,
        statement: String,
        token: ContinuationToken,
        sink: Arc<dyn DbCompletionSink>,
    },
    Execute {
        job: Arc<dyn Job>,
        statement: String,
        token: ContinuationToken,
        sink: Arc<dyn DbCompletionSink>,
    },
}

impl StageEvent for DbEvent {
    fn describe(&self) -> &'static str {
        match self {
            DbEvent::Query { .. } => "query",
            DbEvent::Execute { .. } => "execute",
        }
    }
}

/// Thread pool isolating blocking database calls from request workers.
pub struct DbHelperStage {
    stage: Arc<Stage<DbEvent>>,
}

impl DbHelperStage {
    pub fn new(capacity: QueueCapacity, workers: WorkerCount, client: Arc<dyn DbClient>) -> Arc<Self> {
        Arc::new(Self {
            stage: Stage::new(
                "db-helper",
                capacity,
                workers,
                Arc::new(DbHandlerFactory { client }),
            ),
        })
    }

    pub fn start(&self) {
        self.stage.start();
    }

    pub fn stop(&self) {
        self.stage.stop();
    }

    pub fn query(
        &self,
        job: Arc<dyn Job>,
        statement: impl Into<String>,
        token: ContinuationToken,
        sink: Arc<dyn DbCompletionSink>,
    ) -> Result<(), QueueError> {
        self.stage.post(DbEvent::Query {
            job,
            statement: statement.into(),
            token,
            sink,
        })
    }

    pub fn execute(
        &self,
        job: Arc<dyn Job>,
        statement: impl Into<String>,
        token: ContinuationToken,
        sink: Arc<dyn DbCompletionSink>,
    ) -> Result<(), QueueError> {
        self.stage.post(DbEvent::Execute {
            job,
            statement: statement.into(),
            token,
            sink,
        })
    }
}

impl std::fmt::Debug for DbHelperStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHelperStage").finish_non_exhaustive()
    }
}

struct DbHandlerFactory {
    client: Arc<dyn DbClient>,
}

impl EventHandlerFactory<DbEvent> for DbHandlerFactory {
    fn new_handler(&self) -> Box<dyn EventHandler<DbEvent>> {
        Box::new(DbHandler {
            client: Arc::clone(&self.client),
        })
    }
}

struct DbHandler {
    client: Arc<dyn DbClient>,
}

impl EventHandler<DbEvent> for DbHandler {
    fn handle_event(&mut self, event: DbEvent) -> crate::Result<()> {
        match event {
            DbEvent::Query {
                job,
                statement,
                token,
                sink,
            } => {
                debug!(statement = %statement, "db query");
                let result = self.client.query(&statement).map(DbOutcome::Rows);
                sink.db_complete(job, token, result);
            }
            DbEvent::Execute {
                job,
                statement,
                token,
                sink,
            } => {
                debug!(statement = %statement, "db execute");
                let result = self.client.execute(&statement).map(DbOutcome::Affected);
                sink.db_complete(job, token, result);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eds::job::JobCore;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Plain {
        core: JobCore,
    }

    impl Job for Plain {
        fn core(&self) -> &JobCore {
            &self.core
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
            self
        }
    }

    struct FixedClient;

    impl DbClient for FixedClient {
        fn query(&self, statement: &str) -> Result<DbRows, DbError> {
            if statement.contains("missing") {
                return Err(DbError::Statement("no such table".into()));
            }
            Ok(DbRows {
                columns: vec!["id".into()],
                rows: vec![vec!["1".into()], vec!["2".into()]],
            })
        }

        fn execute(&self, _statement: &str) -> Result<u64, DbError> {
            Ok(3)
        }
    }

    struct ChannelSink {
        tx: Mutex<mpsc::Sender<(ContinuationToken, Result<DbOutcome, DbError>)>>,
    }

    impl DbCompletionSink for ChannelSink {
        fn db_complete(
            &self,
            _job: Arc<dyn Job>,
            token: ContinuationToken,
            result: Result<DbOutcome, DbError>,
        ) {
            self.tx.lock().unwrap().send((token, result)).ok();
        }
    }

    #[test]
    fn query_and_execute_complete_with_tokens() {
        let helper = DbHelperStage::new(
            QueueCapacity::try_new(8).unwrap(),
            WorkerCount::try_new(1).unwrap(),
            Arc::new(FixedClient),
        );
        helper.start();

        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(ChannelSink { tx: Mutex::new(tx) });
        let job: Arc<dyn Job> = Arc::new(Plain { core: JobCore::new() });

        helper
            .query(
                Arc::clone(&job),
                "select id from things",
                ContinuationToken::new(5, 1),
                Arc::clone(&sink) as Arc<dyn DbCompletionSink>,
            )
            .unwrap();
        let (token, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(token.kind, 5);
        match result.unwrap() {
            DbOutcome::Rows(rows) => assert_eq!(rows.rows.len(), 2),
            other => panic!("unexpected outcome: {other:?}"),
        }

        helper
            .execute(
                job,
                "delete from things",
                ContinuationToken::new(6, 0),
                sink as Arc<dyn DbCompletionSink>,
            )
            .unwrap();
        let (token, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(token.kind, 6);
        assert_eq!(result.unwrap(), DbOutcome::Affected(3));

        helper.stop();
    }
}
