use super::*;
use chrono::{DateTime, TimeZone, Utc};
use shared::record::{EventDraft, EventPatch};

fn temp_database_url(tag: &str) -> (String, PathBuf) {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let db_path = std::env::temp_dir().join(format!("planner_storage_{tag}_{suffix}.sqlite3"));
    (format!("sqlite://{}", db_path.display()), db_path)
}

fn stored_date(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("stored date is rfc3339")
        .with_timezone(&Utc)
}

fn draft(owner: &UserId, title: &str, date: DateTime<Utc>) -> EventDraft {
    EventDraft {
        title: title.to_string(),
        date,
        description: String::new(),
        owner_id: owner.clone(),
    }
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("planner_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("planner.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    storage.health_check().await.expect("health check");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn account_roundtrip_and_wrong_password() {
    let (url, db_path) = temp_database_url("accounts");
    let storage = Storage::new(&url).await.expect("db");

    let user = storage
        .create_account("ana@example.com", "secret-1")
        .await
        .expect("account");
    assert_eq!(
        storage
            .verify_credentials("ana@example.com", "secret-1")
            .await
            .expect("verify"),
        Some(user.clone())
    );
    assert_eq!(
        storage
            .verify_credentials("ana@example.com", "wrong")
            .await
            .expect("verify"),
        None
    );
    assert_eq!(
        storage
            .verify_credentials("nobody@example.com", "secret-1")
            .await
            .expect("verify"),
        None
    );
    assert_eq!(
        storage.email_for_user(&user).await.expect("email"),
        Some("ana@example.com".to_string())
    );

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn duplicate_email_is_rejected() {
    let (url, db_path) = temp_database_url("dup_email");
    let storage = Storage::new(&url).await.expect("db");

    storage
        .create_account("ana@example.com", "secret-1")
        .await
        .expect("account");
    let err = storage
        .create_account("ana@example.com", "other")
        .await
        .expect_err("duplicate email");
    assert!(err.to_string().contains("already registered"));

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn active_session_persists_and_clears() {
    let (url, db_path) = temp_database_url("session");
    let storage = Storage::new(&url).await.expect("db");

    assert_eq!(storage.active_session().await.expect("none"), None);

    let user = storage
        .create_account("ana@example.com", "secret-1")
        .await
        .expect("account");
    storage.set_active_session(&user).await.expect("set");
    assert_eq!(
        storage.active_session().await.expect("session"),
        Some(user.clone())
    );

    // Reopening the same file restores the session.
    let reopened = Storage::new(&url).await.expect("reopen");
    assert_eq!(
        reopened.active_session().await.expect("session"),
        Some(user)
    );

    reopened.clear_active_session().await.expect("clear");
    assert_eq!(reopened.active_session().await.expect("none"), None);
    // Clearing twice is harmless.
    reopened.clear_active_session().await.expect("clear again");

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn documents_are_owner_scoped_and_date_descending() {
    let (url, db_path) = temp_database_url("scope");
    let storage = Storage::new(&url).await.expect("db");

    let ana = storage
        .create_account("ana@example.com", "secret-1")
        .await
        .expect("ana");
    let ben = storage
        .create_account("ben@example.com", "secret-2")
        .await
        .expect("ben");

    let early = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap();
    storage
        .insert_event(&draft(&ana, "older", early))
        .await
        .expect("older");
    storage
        .insert_event(&draft(&ana, "newer", late))
        .await
        .expect("newer");
    storage
        .insert_event(&draft(&ben, "bens", late))
        .await
        .expect("bens");

    let docs = storage.documents_for_owner(&ana).await.expect("docs");
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].fields["title"], "newer");
    assert_eq!(docs[1].fields["title"], "older");
    let first = stored_date(docs[0].fields["date"].as_str().expect("date"));
    let second = stored_date(docs[1].fields["date"].as_str().expect("date"));
    assert!(first > second);
    for doc in &docs {
        assert_eq!(doc.fields["ownerId"], ana.0);
    }

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn update_and_delete_report_missing_rows() {
    let (url, db_path) = temp_database_url("update_delete");
    let storage = Storage::new(&url).await.expect("db");

    let ana = storage
        .create_account("ana@example.com", "secret-1")
        .await
        .expect("ana");
    let date = Utc.with_ymd_and_hms(2026, 6, 1, 18, 30, 0).unwrap();
    let id = storage
        .insert_event(&draft(&ana, "dinner", date))
        .await
        .expect("insert");

    let patch = EventPatch {
        title: "dinner (moved)".to_string(),
        date,
        description: "new place".to_string(),
    };
    assert!(storage.update_event(&id, &patch).await.expect("update"));
    let docs = storage.documents_for_owner(&ana).await.expect("docs");
    assert_eq!(docs[0].fields["title"], "dinner (moved)");
    assert_eq!(docs[0].fields["description"], "new place");

    assert!(!storage
        .update_event(&EventId::new("missing"), &patch)
        .await
        .expect("update missing"));

    assert!(storage.delete_event(&id).await.expect("delete"));
    assert!(!storage.delete_event(&id).await.expect("delete again"));
    assert!(storage
        .documents_for_owner(&ana)
        .await
        .expect("docs")
        .is_empty());

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn change_feed_notifies_on_each_mutation() {
    let (url, db_path) = temp_database_url("changes");
    let storage = Storage::new(&url).await.expect("db");
    let mut changes = storage.subscribe_changes();

    let ana = storage
        .create_account("ana@example.com", "secret-1")
        .await
        .expect("ana");
    let date = Utc.with_ymd_and_hms(2026, 2, 14, 20, 0, 0).unwrap();
    let id = storage
        .insert_event(&draft(&ana, "party", date))
        .await
        .expect("insert");
    changes.recv().await.expect("insert notice");

    let patch = EventPatch {
        title: "party".to_string(),
        date,
        description: "bring snacks".to_string(),
    };
    storage.update_event(&id, &patch).await.expect("update");
    changes.recv().await.expect("update notice");

    storage.delete_event(&id).await.expect("delete");
    changes.recv().await.expect("delete notice");

    // A miss on update/delete emits no notice.
    storage
        .delete_event(&EventId::new("missing"))
        .await
        .expect("noop delete");
    assert!(matches!(
        changes.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    let _ = std::fs::remove_file(db_path);
}
