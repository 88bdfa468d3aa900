//! SQL rendering shared by the SQLite statements.
//!
//! [`push_orphan_condition`] is the only place an [`OrphanPredicate`] becomes
//! SQL. `mark_removed` appends it to an `UPDATE`, `select_removed` to a
//! `SELECT`; the two can only differ in what surrounds the condition.

use sqlx::{QueryBuilder, Sqlite};

use feedindex_core::connection::{OrphanPredicate, OrphanScope};
use feedindex_core::metadata::columns;
use feedindex_core::{EntityId, ExportStatus};

/// Quote an identifier, doubling embedded quotes.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `"table"."column"`.
pub fn qualified(table: &str, column: &str) -> String {
    format!("{}.{}", quote(table), quote(column))
}

/// Append `col IN (?, ?, …)`; an empty list renders as `1 = 0`.
pub fn push_in_list(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, ids: &[EntityId]) {
    if ids.is_empty() {
        qb.push("1 = 0");
        return;
    }
    qb.push(format!("{column} IN ("));
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(")");
}

/// Append the condition matching orphaned rows of the predicate's feed table
/// that are not deleted yet or whose deletion failed to export. Columns are
/// qualified with the feed table name.
pub fn push_orphan_condition(qb: &mut QueryBuilder<'_, Sqlite>, predicate: &OrphanPredicate) {
    let feed = predicate.feed_table();
    let id = qualified(feed, predicate.feed_id_field());
    qb.push(format!(
        "({} = 0 OR {} = {})",
        qualified(feed, columns::IS_DELETED),
        qualified(feed, columns::STATUS),
        ExportStatus::FAILED_CODE,
    ));
    match predicate.scope() {
        OrphanScope::All => {}
        OrphanScope::Ids(ids) => {
            qb.push(" AND ");
            push_in_list(qb, &id, ids);
        }
    }

    match predicate {
        OrphanPredicate::MissingSource {
            source_table,
            source_field,
            ..
        } => {
            qb.push(format!(
                " AND NOT EXISTS (SELECT 1 FROM {} AS src_ WHERE src_.{} = {id})",
                quote(source_table),
                quote(source_field),
            ));
        }
        OrphanPredicate::DetachedVariant {
            feed_parent_field,
            relation_table,
            relation_child_field,
            relation_parent_field,
            entity_table,
            entity_id_field,
            entity_link_field,
            ..
        } => {
            let parent = qualified(feed, feed_parent_field);
            qb.push(format!(
                " AND (NOT EXISTS (SELECT 1 FROM {entity} AS ent_ WHERE ent_.{entity_id} = {id}) \
                 OR NOT EXISTS (SELECT 1 FROM {relation} AS rel_ WHERE rel_.{rel_child} = {id} \
                 AND (SELECT par_.{entity_id} FROM {entity} AS par_ \
                 WHERE par_.{link} = rel_.{rel_parent} LIMIT 1) = CAST({parent} AS INTEGER)))",
                entity = quote(entity_table),
                entity_id = quote(entity_id_field),
                relation = quote(relation_table),
                rel_child = quote(relation_child_field),
                rel_parent = quote(relation_parent_field),
                link = quote(entity_link_field),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedindex_core::FeedIndexMetadata;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote("feed"), "\"feed\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("t", "c"), "\"t\".\"c\"");
    }

    #[test]
    fn missing_source_condition() {
        let meta = FeedIndexMetadata {
            feed_table_name: "feed".into(),
            source_table_name: "src".into(),
            ..Default::default()
        };
        let pred = OrphanPredicate::missing_source(&meta, OrphanScope::Ids(vec![1, 2]));
        let mut qb = QueryBuilder::<Sqlite>::new("");
        push_orphan_condition(&mut qb, &pred);
        assert_eq!(
            qb.sql(),
            "(\"feed\".\"is_deleted\" = 0 OR \"feed\".\"status\" = 500) \
             AND \"feed\".\"source_entity_id\" IN (?, ?) \
             AND NOT EXISTS (SELECT 1 FROM \"src\" AS src_ WHERE src_.\"entity_id\" = \"feed\".\"source_entity_id\")"
        );
    }

    #[test]
    fn empty_scope_matches_nothing() {
        let meta = FeedIndexMetadata::default();
        let pred = OrphanPredicate::missing_source(&meta, OrphanScope::Ids(vec![]));
        let mut qb = QueryBuilder::<Sqlite>::new("");
        push_orphan_condition(&mut qb, &pred);
        assert!(qb.sql().contains("AND 1 = 0"));
    }
}
