use log::{error, info, warn};
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Database, IndexModel};
use rocket::fairing::AdHoc;

use crate::models::{MembershipScheme, Order, UsageRecord, User};

pub fn init() -> AdHoc {
    AdHoc::on_ignite("MongoDB", |rocket| async {
        match connect().await {
            Ok(database) => {
                info!("MongoDB connected");
                if let Err(e) = ensure_indexes(&database).await {
                    error!("Failed to create indexes: {}", e);
                }
                if let Err(e) = seed_scheme_catalog(&database).await {
                    error!("Failed to seed scheme catalog: {}", e);
                }
                rocket.manage(database)
            }
            Err(e) => {
                error!("Failed to connect to MongoDB: {}", e);
                rocket
            }
        }
    })
}

async fn connect() -> Result<Database, mongodb::error::Error> {
    let uri = crate::config::Config::mongodb_uri();
    let client = Client::with_uri_str(&uri).await?;

    // Test connection
    client
        .database("admin")
        .run_command(doc! {"ping": 1}, None)
        .await?;

    Ok(client.database("jobwave"))
}

/// The unique indexes are load-bearing, not advisory: the `(user_id,
/// job_id)` index turns a concurrent usage-record creation into a
/// duplicate-key error the debit engine resolves, and `order_id` backs the
/// collision probe during order creation.
async fn ensure_indexes(db: &Database) -> Result<(), mongodb::error::Error> {
    let unique = IndexOptions::builder().unique(true).build();

    db.collection::<User>("users")
        .create_index(
            IndexModel::builder()
                .keys(doc! { "openid": 1 })
                .options(unique.clone())
                .build(),
            None,
        )
        .await?;

    db.collection::<Order>("orders")
        .create_index(
            IndexModel::builder()
                .keys(doc! { "order_id": 1 })
                .options(unique.clone())
                .build(),
            None,
        )
        .await?;

    db.collection::<UsageRecord>("usage_records")
        .create_index(
            IndexModel::builder()
                .keys(doc! { "user_id": 1, "job_id": 1 })
                .options(unique)
                .build(),
            None,
        )
        .await?;

    Ok(())
}

async fn seed_scheme_catalog(db: &Database) -> Result<(), mongodb::error::Error> {
    let schemes = db.collection::<MembershipScheme>("membership_schemes");
    let count = schemes.count_documents(None, None).await?;
    if count > 0 {
        return Ok(());
    }

    let catalog = MembershipScheme::default_catalog();
    let n = catalog.len();
    schemes.insert_many(catalog, None).await?;
    warn!("Seeded membership scheme catalog with {} default tiers", n);
    Ok(())
}

/// Mongo's duplicate-key write error (code 11000).
pub fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(we)) => {
            we.code == 11000
        }
        _ => false,
    }
}

pub type DbConn = Database;
