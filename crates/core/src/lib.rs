//! Pure building blocks shared by the webhook service: payload model,
//! field normalization, topic URL building and the topic descriptor table.
pub mod normalizer;
pub mod payload;
pub mod topic;
pub mod types;
pub mod url_builder;

pub use normalizer::{fields_to_enum, make_fields_datetime, NormalizerError};
pub use payload::Payload;
pub use topic::{AuthRequirement, EmptyData, Topic};
pub use types::{AuthType, EnumMember, HypeTrainContributionMethod, WireEnum};
pub use url_builder::{build_url, BuildOptions, QueryValue, UrlBuildError};
