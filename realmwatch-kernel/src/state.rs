use time::OffsetDateTime;
use uuid::Uuid;

/// Identifiant d'enregistrement (realm, host, service, live state)
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Jeton de concurrence optimiste, renouvelé à chaque écriture
pub fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
