//! Schema reader for the reference manager's SQLite store.
//!
//! Every selected column is cast to its storage class in SQL. The source
//! schema declares columns such as `TIMESTAMP` that have no native decoder,
//! and the cast lets rows decode by value type instead of declared type.
//!
//! All queries of one snapshot run inside a single read transaction, so the
//! tables are read from the same state of the database.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, trace};

use refkb_core::{
    AnnotationRow, AttachmentRow, CollectionMembershipRow, CreatorRow, LibraryReader,
    LibrarySnapshot, PaperRow, Result, SnapshotScope,
};

const PAPERS_SQL: &str = r#"
    SELECT CAST(i.itemID AS INTEGER) AS paper_id,
           CAST(i.key AS TEXT) AS item_key,
           CAST(i.dateAdded AS TEXT) AS date_added,
           CAST(i.dateModified AS TEXT) AS date_modified,
           (SELECT CAST(v.value AS TEXT)
              FROM itemData d
              JOIN fields f ON f.fieldID = d.fieldID
              JOIN itemDataValues v ON v.valueID = d.valueID
             WHERE d.itemID = i.itemID AND f.fieldName = 'title'
             LIMIT 1) AS title
    FROM items i
    JOIN itemTypes t ON t.itemTypeID = i.itemTypeID
    WHERE t.typeName NOT IN ('attachment', 'note', 'annotation')
      AND i.itemID NOT IN (SELECT itemID FROM deletedItems)
    ORDER BY i.dateAdded DESC, i.itemID
"#;

const CREATORS_SQL: &str = r#"
    SELECT CAST(ic.itemID AS INTEGER) AS paper_id,
           CAST(ic.orderIndex AS INTEGER) AS order_index,
           CAST(c.firstName AS TEXT) AS first_name,
           CAST(c.lastName AS TEXT) AS last_name
    FROM itemCreators ic
    JOIN creators c ON c.creatorID = ic.creatorID
    ORDER BY ic.itemID, ic.orderIndex
"#;

const COLLECTIONS_SQL: &str = r#"
    SELECT CAST(ci.itemID AS INTEGER) AS paper_id,
           CAST(c.collectionName AS TEXT) AS collection_name
    FROM collectionItems ci
    JOIN collections c ON c.collectionID = ci.collectionID
    ORDER BY ci.itemID
"#;

const ATTACHMENTS_SQL: &str = r#"
    SELECT CAST(a.itemID AS INTEGER) AS attachment_id,
           CAST(a.parentItemID AS INTEGER) AS paper_id,
           CAST(i.key AS TEXT) AS item_key,
           CAST(i.dateAdded AS TEXT) AS date_added,
           CAST(a.contentType AS TEXT) AS content_type,
           CAST(a.path AS TEXT) AS path,
           CAST(a.linkMode AS INTEGER) AS link_mode
    FROM itemAttachments a
    JOIN items i ON i.itemID = a.itemID
    WHERE a.itemID NOT IN (SELECT itemID FROM deletedItems)
    ORDER BY a.itemID
"#;

const ANNOTATIONS_SQL: &str = r#"
    SELECT CAST(ia.itemID AS INTEGER) AS annotation_id,
           CAST(ia.parentItemID AS INTEGER) AS attachment_id,
           CAST(ia.type AS INTEGER) AS annotation_type,
           CAST(ia.text AS TEXT) AS text,
           CAST(ia.comment AS TEXT) AS comment,
           CAST(ia.color AS TEXT) AS color,
           CAST(ia.pageLabel AS TEXT) AS page_label
    FROM itemAnnotations ia
    WHERE ia.itemID NOT IN (SELECT itemID FROM deletedItems)
    ORDER BY ia.parentItemID, ia.sortIndex, ia.itemID
"#;

/// SQLite implementation of [`LibraryReader`].
pub struct SqliteLibraryReader {
    pool: SqlitePool,
}

impl SqliteLibraryReader {
    /// Create a new SqliteLibraryReader with the given read-only pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Regular items (papers), excluding trashed items.
    pub async fn papers(conn: &mut SqliteConnection) -> Result<Vec<PaperRow>> {
        fetch(conn, "items", PAPERS_SQL, paper_row).await
    }

    /// Creator links for all papers.
    pub async fn creators(conn: &mut SqliteConnection) -> Result<Vec<CreatorRow>> {
        fetch(conn, "itemCreators", CREATORS_SQL, creator_row).await
    }

    /// Collection memberships for all papers.
    pub async fn collection_memberships(
        conn: &mut SqliteConnection,
    ) -> Result<Vec<CollectionMembershipRow>> {
        fetch(conn, "collectionItems", COLLECTIONS_SQL, collection_row).await
    }

    /// All attachment items, excluding trashed items.
    pub async fn attachments(conn: &mut SqliteConnection) -> Result<Vec<AttachmentRow>> {
        fetch(conn, "itemAttachments", ATTACHMENTS_SQL, attachment_row).await
    }

    /// All annotation items, excluding trashed items.
    pub async fn annotations(conn: &mut SqliteConnection) -> Result<Vec<AnnotationRow>> {
        fetch(conn, "itemAnnotations", ANNOTATIONS_SQL, annotation_row).await
    }
}

async fn fetch<T>(
    conn: &mut SqliteConnection,
    table: &'static str,
    sql: &'static str,
    map: fn(&SqliteRow) -> std::result::Result<T, sqlx::Error>,
) -> Result<Vec<T>> {
    let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;
    trace!(
        subsystem = "db",
        component = "reader",
        table,
        row_count = rows.len(),
        "Fetched source rows"
    );
    let mapped = rows.iter().map(map).collect::<std::result::Result<_, _>>()?;
    Ok(mapped)
}

fn paper_row(r: &SqliteRow) -> std::result::Result<PaperRow, sqlx::Error> {
    Ok(PaperRow {
        paper_id: r.try_get("paper_id")?,
        key: r.try_get::<Option<String>, _>("item_key")?.unwrap_or_default(),
        date_added: r.try_get::<Option<String>, _>("date_added")?.unwrap_or_default(),
        date_modified: r
            .try_get::<Option<String>, _>("date_modified")?
            .unwrap_or_default(),
        title: r.try_get("title")?,
    })
}

fn creator_row(r: &SqliteRow) -> std::result::Result<CreatorRow, sqlx::Error> {
    Ok(CreatorRow {
        paper_id: r.try_get("paper_id")?,
        order_index: r.try_get::<Option<i64>, _>("order_index")?.unwrap_or(0),
        first_name: r.try_get("first_name")?,
        last_name: r.try_get("last_name")?,
    })
}

fn collection_row(r: &SqliteRow) -> std::result::Result<CollectionMembershipRow, sqlx::Error> {
    Ok(CollectionMembershipRow {
        paper_id: r.try_get("paper_id")?,
        collection_name: r.try_get("collection_name")?,
    })
}

fn attachment_row(r: &SqliteRow) -> std::result::Result<AttachmentRow, sqlx::Error> {
    Ok(AttachmentRow {
        attachment_id: r.try_get("attachment_id")?,
        paper_id: r.try_get("paper_id")?,
        key: r.try_get::<Option<String>, _>("item_key")?.unwrap_or_default(),
        date_added: r.try_get::<Option<String>, _>("date_added")?.unwrap_or_default(),
        content_type: r.try_get("content_type")?,
        path: r.try_get("path")?,
        link_mode: r.try_get("link_mode")?,
    })
}

fn annotation_row(r: &SqliteRow) -> std::result::Result<AnnotationRow, sqlx::Error> {
    Ok(AnnotationRow {
        annotation_id: r.try_get("annotation_id")?,
        attachment_id: r.try_get("attachment_id")?,
        annotation_type: r.try_get::<Option<i64>, _>("annotation_type")?.unwrap_or(0),
        text: r.try_get("text")?,
        comment: r.try_get("comment")?,
        color: r.try_get("color")?,
        page_label: r.try_get("page_label")?,
    })
}

#[async_trait]
impl LibraryReader for SqliteLibraryReader {
    async fn snapshot(&self, scope: SnapshotScope) -> Result<LibrarySnapshot> {
        let mut tx = self.pool.begin().await?;
        let mut snapshot = LibrarySnapshot {
            papers: Self::papers(&mut *tx).await?,
            ..Default::default()
        };
        match scope {
            SnapshotScope::Metadata => {
                snapshot.creators = Self::creators(&mut *tx).await?;
                snapshot.collection_memberships = Self::collection_memberships(&mut *tx).await?;
                snapshot.attachments = Self::attachments(&mut *tx).await?;
            }
            SnapshotScope::Annotations => {
                snapshot.attachments = Self::attachments(&mut *tx).await?;
                snapshot.annotations = Self::annotations(&mut *tx).await?;
            }
        }
        tx.commit().await?;

        debug!(
            subsystem = "db",
            component = "reader",
            ?scope,
            paper_count = snapshot.papers.len(),
            attachment_count = snapshot.attachments.len(),
            annotation_count = snapshot.annotations.len(),
            "Read library snapshot"
        );
        Ok(snapshot)
    }
}
