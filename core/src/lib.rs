pub mod conversations;
pub mod db;
pub mod display_name;
pub mod error;
pub mod feed;
pub mod messages;
pub mod recommendations;
pub mod services;
pub mod trips;
pub mod users;
pub mod weather;

pub use db::{init_db, open_pool, DbPool};
pub use display_name::{NameDirectory, PoolDirectory};
pub use error::{CoreError, Result};
pub use feed::{FeedSubscription, FeedUpdate, MessageFeed};
pub use services::notify::{Notification, NotificationSink, NullSink, TracingSink};
pub use services::preferences::Preferences;
pub use weather::{WeatherClient, WeatherReport};
