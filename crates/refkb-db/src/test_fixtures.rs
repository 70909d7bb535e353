//! Test fixtures for library integration tests.
//!
//! Builds a throwaway SQLite file with the subset of the reference
//! manager's schema the reader queries. Compiled unconditionally so the
//! integration tests under `tests/` (and downstream crates) can use it.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use refkb_db::test_fixtures::TestLibrary;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let lib = TestLibrary::new().await;
//!     let paper = lib.add_paper("Soil carbon", "2024-01-01 00:00:00").await;
//!     lib.add_attachment(Some(paper), "application/pdf", "storage:soil.pdf").await;
//!
//!     let library = refkb_db::Library::open(&lib.config()).await.unwrap();
//!     // ...
//! }
//! ```
//!
//! Fixture helpers panic on failure; they are test support, not library API.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;

use refkb_core::ItemId;

use crate::config::LibraryConfig;
use crate::pool::open_read_only;

/// Item type ids seeded into `itemTypes`.
pub const ITEM_TYPE_BOOK: i64 = 2;
pub const ITEM_TYPE_ATTACHMENT: i64 = 3;
pub const ITEM_TYPE_ANNOTATION: i64 = 14;
pub const ITEM_TYPE_JOURNAL_ARTICLE: i64 = 22;
pub const ITEM_TYPE_NOTE: i64 = 28;

const FIELD_TITLE: i64 = 1;
const FIELD_ABSTRACT: i64 = 2;

const SCHEMA: &str = r#"
CREATE TABLE itemTypes (
    itemTypeID INTEGER PRIMARY KEY,
    typeName TEXT,
    templateItemTypeID INT,
    display INT DEFAULT 1
);
CREATE TABLE items (
    itemID INTEGER PRIMARY KEY,
    itemTypeID INT NOT NULL,
    dateAdded TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    dateModified TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    clientDateModified TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    libraryID INT NOT NULL DEFAULT 1,
    key TEXT NOT NULL,
    UNIQUE (libraryID, key)
);
CREATE TABLE fields (
    fieldID INTEGER PRIMARY KEY,
    fieldName TEXT,
    fieldFormatID INT
);
CREATE TABLE itemDataValues (
    valueID INTEGER PRIMARY KEY,
    value
);
CREATE TABLE itemData (
    itemID INT,
    fieldID INT,
    valueID,
    PRIMARY KEY (itemID, fieldID)
);
CREATE TABLE creators (
    creatorID INTEGER PRIMARY KEY,
    firstName TEXT,
    lastName TEXT,
    fieldMode INT
);
CREATE TABLE itemCreators (
    itemID INT NOT NULL,
    creatorID INT NOT NULL,
    creatorTypeID INT NOT NULL DEFAULT 1,
    orderIndex INT NOT NULL DEFAULT 0,
    PRIMARY KEY (itemID, creatorID, creatorTypeID, orderIndex)
);
CREATE TABLE collections (
    collectionID INTEGER PRIMARY KEY,
    collectionName TEXT NOT NULL,
    parentCollectionID INT DEFAULT NULL,
    libraryID INT NOT NULL DEFAULT 1,
    key TEXT NOT NULL DEFAULT ''
);
CREATE TABLE collectionItems (
    collectionID INT NOT NULL,
    itemID INT NOT NULL,
    orderIndex INT NOT NULL DEFAULT 0,
    PRIMARY KEY (collectionID, itemID)
);
CREATE TABLE itemAttachments (
    itemID INTEGER PRIMARY KEY,
    parentItemID INT,
    linkMode INT,
    contentType TEXT,
    charsetID INT,
    path TEXT,
    syncState INT DEFAULT 0
);
CREATE TABLE itemAnnotations (
    itemID INTEGER PRIMARY KEY,
    parentItemID INT NOT NULL,
    type INTEGER NOT NULL,
    authorName TEXT,
    text TEXT,
    comment TEXT,
    color TEXT,
    pageLabel TEXT,
    sortIndex TEXT NOT NULL,
    position TEXT NOT NULL,
    isExternal INT NOT NULL DEFAULT 0
);
CREATE TABLE deletedItems (
    itemID INTEGER PRIMARY KEY,
    dateDeleted DEFAULT CURRENT_TIMESTAMP NOT NULL
);
INSERT INTO itemTypes (itemTypeID, typeName) VALUES
    (2, 'book'), (3, 'attachment'), (14, 'annotation'),
    (22, 'journalArticle'), (28, 'note');
INSERT INTO fields (fieldID, fieldName) VALUES (1, 'title'), (2, 'abstractNote');
"#;

/// A temporary reference library with a writable fixture connection.
pub struct TestLibrary {
    dir: TempDir,
    db_path: PathBuf,
    writer: SqlitePool,
    next_id: AtomicI64,
}

impl TestLibrary {
    /// Create an empty library with the schema and lookup tables seeded.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("create fixture directory");
        let db_path = dir.path().join("zotero.sqlite");
        let writer = writable_pool(&db_path).await;
        sqlx::raw_sql(SCHEMA)
            .execute(&writer)
            .await
            .expect("create fixture schema");

        Self {
            dir,
            db_path,
            writer,
            next_id: AtomicI64::new(100),
        }
    }

    /// Library configuration pointing at this fixture.
    pub fn config(&self) -> LibraryConfig {
        LibraryConfig::new(&self.db_path)
    }

    /// Data directory of the fixture (parent of the database file).
    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Open a read-only pool, as production code does.
    pub async fn open_pool(&self) -> SqlitePool {
        open_read_only(&self.config())
            .await
            .expect("open fixture read-only")
    }

    fn next_id(&self) -> ItemId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn insert_item(&self, item_type: i64, date_added: &str) -> ItemId {
        let id = self.next_id();
        sqlx::query(
            "INSERT INTO items (itemID, itemTypeID, dateAdded, dateModified, key)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(item_type)
        .bind(date_added)
        .bind(date_added)
        .bind(format!("K{:07}", id))
        .execute(&self.writer)
        .await
        .expect("insert item");
        id
    }

    async fn set_field(&self, item_id: ItemId, field_id: i64, value: &str) {
        let value_id = self.next_id();
        sqlx::query("INSERT INTO itemDataValues (valueID, value) VALUES (?, ?)")
            .bind(value_id)
            .bind(value)
            .execute(&self.writer)
            .await
            .expect("insert value");
        sqlx::query("INSERT INTO itemData (itemID, fieldID, valueID) VALUES (?, ?, ?)")
            .bind(item_id)
            .bind(field_id)
            .bind(value_id)
            .execute(&self.writer)
            .await
            .expect("insert item data");
    }

    /// Add a journal article with a title and an unrelated abstract field.
    pub async fn add_paper(&self, title: &str, date_added: &str) -> ItemId {
        let id = self.insert_item(ITEM_TYPE_JOURNAL_ARTICLE, date_added).await;
        self.set_field(id, FIELD_TITLE, title).await;
        self.set_field(id, FIELD_ABSTRACT, "An abstract").await;
        id
    }

    /// Add a book with no title field.
    pub async fn add_untitled_paper(&self, date_added: &str) -> ItemId {
        self.insert_item(ITEM_TYPE_BOOK, date_added).await
    }

    /// Add a standalone note item.
    pub async fn add_note(&self) -> ItemId {
        self.insert_item(ITEM_TYPE_NOTE, "2024-01-01 00:00:00").await
    }

    /// Link a creator to a paper at the given position.
    pub async fn add_creator(
        &self,
        paper_id: ItemId,
        order_index: i64,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) {
        let creator_id = self.next_id();
        sqlx::query("INSERT INTO creators (creatorID, firstName, lastName, fieldMode) VALUES (?, ?, ?, 0)")
            .bind(creator_id)
            .bind(first_name)
            .bind(last_name)
            .execute(&self.writer)
            .await
            .expect("insert creator");
        sqlx::query("INSERT INTO itemCreators (itemID, creatorID, orderIndex) VALUES (?, ?, ?)")
            .bind(paper_id)
            .bind(creator_id)
            .bind(order_index)
            .execute(&self.writer)
            .await
            .expect("insert item creator");
    }

    /// Create a collection and return its id.
    pub async fn add_collection(&self, name: &str) -> i64 {
        let id = self.next_id();
        sqlx::query("INSERT INTO collections (collectionID, collectionName, key) VALUES (?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(format!("C{:07}", id))
            .execute(&self.writer)
            .await
            .expect("insert collection");
        id
    }

    /// Put an item in a collection.
    pub async fn add_to_collection(&self, collection_id: i64, item_id: ItemId) {
        sqlx::query("INSERT INTO collectionItems (collectionID, itemID) VALUES (?, ?)")
            .bind(collection_id)
            .bind(item_id)
            .execute(&self.writer)
            .await
            .expect("insert collection item");
    }

    /// Add an imported-file attachment.
    pub async fn add_attachment(
        &self,
        paper_id: Option<ItemId>,
        content_type: &str,
        path: &str,
    ) -> ItemId {
        self.add_attachment_with(paper_id, Some(content_type), Some(path), Some(0))
            .await
    }

    /// Add a standalone attachment with neither content type nor path.
    pub async fn add_standalone_attachment_without_type(&self) -> ItemId {
        self.add_attachment_with(None, None, None, Some(3)).await
    }

    /// Add an attachment with every nullable column under control.
    pub async fn add_attachment_with(
        &self,
        paper_id: Option<ItemId>,
        content_type: Option<&str>,
        path: Option<&str>,
        link_mode: Option<i64>,
    ) -> ItemId {
        let id = self
            .insert_item(ITEM_TYPE_ATTACHMENT, "2024-01-01 00:00:00")
            .await;
        sqlx::query(
            "INSERT INTO itemAttachments (itemID, parentItemID, linkMode, contentType, path)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(paper_id)
        .bind(link_mode)
        .bind(content_type)
        .bind(path)
        .execute(&self.writer)
        .await
        .expect("insert attachment");
        id
    }

    /// Add an annotation placed after all earlier ones on the attachment.
    pub async fn add_annotation(
        &self,
        attachment_id: ItemId,
        annotation_type: i64,
        text: &str,
        page_label: Option<&str>,
    ) -> ItemId {
        let sort_index = format!("00000|{:06}|00000", self.next_id());
        self.insert_annotation(attachment_id, annotation_type, text, page_label, &sort_index)
            .await
    }

    /// Add an annotation with an explicit in-page sort index.
    pub async fn add_annotation_sorted(
        &self,
        attachment_id: ItemId,
        annotation_type: i64,
        text: &str,
        sort_index: &str,
    ) -> ItemId {
        self.insert_annotation(attachment_id, annotation_type, text, Some("1"), sort_index)
            .await
    }

    async fn insert_annotation(
        &self,
        attachment_id: ItemId,
        annotation_type: i64,
        text: &str,
        page_label: Option<&str>,
        sort_index: &str,
    ) -> ItemId {
        let id = self
            .insert_item(ITEM_TYPE_ANNOTATION, "2024-01-01 00:00:00")
            .await;
        sqlx::query(
            "INSERT INTO itemAnnotations
                (itemID, parentItemID, type, text, comment, color, pageLabel, sortIndex, position)
             VALUES (?, ?, ?, ?, NULL, '#ffd400', ?, ?, '{}')",
        )
        .bind(id)
        .bind(attachment_id)
        .bind(annotation_type)
        .bind(text)
        .bind(page_label)
        .bind(sort_index)
        .execute(&self.writer)
        .await
        .expect("insert annotation");
        id
    }

    /// Set the comment of an existing annotation.
    pub async fn set_annotation_comment(&self, annotation_id: ItemId, comment: &str) {
        sqlx::query("UPDATE itemAnnotations SET comment = ? WHERE itemID = ?")
            .bind(comment)
            .bind(annotation_id)
            .execute(&self.writer)
            .await
            .expect("update annotation");
    }

    /// Move an item to the trash.
    pub async fn trash(&self, item_id: ItemId) {
        sqlx::query("INSERT INTO deletedItems (itemID) VALUES (?)")
            .bind(item_id)
            .execute(&self.writer)
            .await
            .expect("trash item");
    }
}

/// Create a valid SQLite file with no tables.
pub async fn create_empty_database(path: &Path) {
    let pool = writable_pool(path).await;
    sqlx::query("CREATE TABLE unrelated (id INTEGER PRIMARY KEY)")
        .execute(&pool)
        .await
        .expect("create placeholder table");
    pool.close().await;
}

async fn writable_pool(path: &Path) -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("open fixture database")
}
