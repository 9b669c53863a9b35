pub const PAPERS: &str = "papers";
pub const SUBSCRIBERS: &str = "subscribers";
pub const DELIVERIES: &str = "deliveries";
pub const META: &str = "meta";

// Secondary index trees
pub const PAPERS_BY_ADDED: &str = "papers_by_added";
pub const DELIVERIES_BY_RECIPIENT: &str = "deliveries_by_recipient";
