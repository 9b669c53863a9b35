/// CAS（Compare-And-Swap）操作最大重试次数
pub const MAX_CAS_RETRIES: u32 = 20;

/// 默认抓取间隔（小时）
pub const DEFAULT_FETCH_INTERVAL_HOURS: u32 = 6;

/// 单条检索式允许的最大结果数上限
pub const DEFAULT_MAX_RESULTS_CAP: u32 = 20;

/// 未指定时单条检索式的结果数
pub const DEFAULT_QUERY_MAX_RESULTS: u32 = 10;

/// 只推送发布时间在此天数之内的论文
pub const DEFAULT_SINCE_DAYS: u32 = 7;
pub const MAX_SINCE_DAYS: u32 = 3650;

/// 轮询间隔上限（一年）
pub const MAX_INTERVAL_HOURS: u32 = 8760;

/// 对话会话超时（秒）
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 180;

/// Pending 投递记录被视为失效的时长（分钟）
pub const DEFAULT_STALE_CLAIM_MINUTES: i64 = 30;

/// arXiv 建议两次 API 调用至少间隔 3 秒
pub const DEFAULT_ARXIV_REQUEST_INTERVAL_MS: u64 = 3_000;

/// Telegram 单条消息最大字符数
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

pub const AR5IV_BASE_URL: &str = "https://ar5iv.labs.arxiv.org/html";

/// 默认 LLM 标签数量
pub const DEFAULT_MAX_TAGS: usize = 5;

/// 投递历史接口默认条数
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// 列表接口最大条数
pub const MAX_PAGE_SIZE: usize = 100;

pub const EXAMPLE_QUERY: &str = r#"cat:cs.CV AND all:"object detection""#;
