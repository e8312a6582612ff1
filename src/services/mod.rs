// 服务模块
// 组卷流水线的各个环节

pub mod cache;
pub mod database;
pub mod llama;
pub mod orchestrator;
pub mod pregen;
pub mod prompt;
pub mod repository;
pub mod selector;
pub mod validator;
pub mod vector;

pub use cache::{
    CacheMetricsSnapshot,
    CacheTier,
    MemoryTier,
    SqliteCacheTier,
    TieredCache,
};

pub use database::{
    DatabaseService,
    SqliteSessions,
};

pub use llama::{
    LlamaClient,
    QuestionGenerator,
    TextEmbedder,
};

pub use orchestrator::{
    pregen_status_key,
    test_cache_key,
    AppContext,
    MetricsSnapshot,
    Orchestrator,
    PipelineMetrics,
    TestRequest,
};

pub use pregen::{PregenJob, PregenQueue};
pub use prompt::QuestionPrompt;

pub use repository::{
    BankFetch,
    BankFilter,
    BankScope,
    QuestionRepository,
    QuestionStore,
    SessionFactory,
};

pub use selector::{AdaptiveSelector, DifficultyMix};
pub use validator::{BatchValidation, QualityValidator, ValidationReport};
pub use vector::{cosine_similarity, EmbeddingIndex, NoopVectorSearch, SimilarQuestion, VectorSearch};
