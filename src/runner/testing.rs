//! Test harness for the runner and dispatcher
//!
//! A scripted LLM plus an in-memory database let the full course
//! lifecycle run without network or disk beyond a temp artifact root.

use super::AgentRunner;
use crate::artifacts::ArtifactStore;
use crate::db::{CourseStatus, CourseTrigger, Database, MessageRole};
use crate::events::{EventBus, EventPublisher};
use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError};
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// LLM client that replays a fixed script of responses
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<ChatResponse, String>>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Result<ChatResponse, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(LlmError::server_error(message)),
            None => Err(LlmError::server_error("scripted responses exhausted")),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Everything a runner test needs, wired to in-memory stores
pub struct InMemoryHarness {
    pub db: Database,
    pub events: EventPublisher,
    pub tools: Arc<ToolRegistry>,
    pub artifacts: ArtifactStore,
    pub llm: Arc<ScriptedLlm>,
    _artifact_root: TempDir,
}

impl InMemoryHarness {
    pub fn new(llm: ScriptedLlm) -> Self {
        let db = Database::open_in_memory().unwrap();
        let artifact_root = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(artifact_root.path()).unwrap();
        let events = EventPublisher::new(db.clone(), Arc::new(EventBus::new()));
        Self {
            db,
            events,
            tools: Arc::new(ToolRegistry::new(artifacts.clone())),
            artifacts,
            llm: Arc::new(llm),
            _artifact_root: artifact_root,
        }
    }

    pub fn runner(&self) -> AgentRunner {
        AgentRunner::new(
            self.db.clone(),
            self.llm.clone(),
            self.tools.clone(),
            self.events.clone(),
        )
    }
}

/// IDs produced by [`seed_concierge`]
pub struct Seeded {
    pub owner_id: i64,
    pub fiche_id: i64,
    pub thread_id: i64,
    pub course_id: i64,
}

/// Seed a user, concierge fiche, thread with one user message, and a
/// RUNNING course
pub fn seed_concierge(db: &Database, user_text: &str) -> Seeded {
    let email = format!("{}@example.com", uuid::Uuid::new_v4());
    let owner = db.create_user(&email, &format!("tok-{email}")).unwrap();
    let fiche = db
        .create_fiche(owner.id, "concierge", "You are the concierge.", "", "scripted", &[])
        .unwrap();
    let thread = db.create_thread(fiche.id, None).unwrap();
    db.append_message(thread.id, MessageRole::User, user_text, None)
        .unwrap();
    let course = db
        .create_course(
            fiche.id,
            thread.id,
            CourseStatus::Running,
            CourseTrigger::Api,
            &uuid::Uuid::new_v4().to_string(),
            None,
        )
        .unwrap();
    Seeded {
        owner_id: owner.id,
        fiche_id: fiche.id,
        thread_id: thread.id,
        course_id: course.id,
    }
}
