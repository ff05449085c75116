use std::{fs, path::PathBuf};

use concat_with::concat_line;
use mailmerge::{row, Row, RowSource};
use tempfile::{tempdir, TempDir};

fn source(contents: &str) -> (TempDir, RowSource) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.csv");
    fs::write(&path, contents).unwrap();
    (dir, RowSource::new(path))
}

fn collect(source: &RowSource) -> Vec<Row> {
    source
        .rows()
        .unwrap()
        .collect::<row::Result<Vec<_>>>()
        .unwrap()
}

#[test_log::test]
fn read_comma_separated_rows() {
    let (_dir, source) = source(concat_line!(
        "email,name,number",
        "alice@test.com,Alice,17",
        "bob@test.com,Bob,42",
    ));

    let rows = collect(&source);

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("email"), Some("alice@test.com"));
    assert_eq!(rows[0].get("name"), Some("Alice"));
    assert_eq!(rows[1].get("number"), Some("42"));
    assert_eq!(rows[1].get("unknown"), None);
}

#[test_log::test]
fn read_tab_and_semicolon_separated_rows() {
    let (_dir, tabs) = source("email\tname\nalice@test.com\tAlice, Jr\n");
    let rows = collect(&tabs);
    assert_eq!(rows[0].get("name"), Some("Alice, Jr"));

    let (_dir, semicolons) = source("email;name\nbob@test.com;Bob\n");
    let rows = collect(&semicolons);
    assert_eq!(rows[0].get("email"), Some("bob@test.com"));
    assert_eq!(rows[0].get("name"), Some("Bob"));
}

#[test_log::test]
fn strip_byte_order_mark() {
    let (_dir, source) = source("\u{feff}email,name\nalice@test.com,Alice\n");

    let rows = source.rows().unwrap();
    assert_eq!(rows.field_names(), ["email", "name"]);

    let rows = rows.collect::<row::Result<Vec<_>>>().unwrap();
    assert_eq!(rows[0].get("email"), Some("alice@test.com"));
}

#[test_log::test]
fn keep_field_order() {
    let (_dir, source) = source("zeta,alpha,mid\n1,2,3\n");

    let rows = collect(&source);
    let fields: Vec<_> = rows[0].iter().collect();

    assert_eq!(fields, vec![("zeta", "1"), ("alpha", "2"), ("mid", "3")]);
}

#[test_log::test]
fn read_quoted_fields() {
    let (_dir, source) = source(concat_line!(
        "email,message",
        "alice@test.com,\"Hello,",
        "\"\"world\"\"\"",
        "bob@test.com,plain",
    ));

    let rows = collect(&source);

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("message"), Some("Hello,\n\"world\""));
    assert_eq!(rows[1].get("message"), Some("plain"));
}

#[test_log::test]
fn header_only_source_has_no_rows() {
    let (_dir, source) = source("email,name\n");
    assert!(collect(&source).is_empty());
}

#[test_log::test]
fn unequal_columns_report_line() {
    let (_dir, source) = source(concat_line!("a,b", "1,2", "3", "4,5"));

    let mut rows = source.rows().unwrap();

    let first = rows.next().unwrap().unwrap();
    assert_eq!(first.get("a"), Some("1"));

    let err = rows.next().unwrap().unwrap_err();
    assert!(matches!(err, row::Error::ParseRowError { .. }));
    assert_eq!(err.line(), Some(3));
    assert!(err.to_string().contains("at line 3"));
}

#[test_log::test]
fn unterminated_quote_reports_opening_line() {
    let (_dir, source) = source("a,b\n1,\"2\n3,4\n");

    let results: Vec<_> = source.rows().unwrap().collect();

    assert_eq!(results.len(), 1);
    let err = results.into_iter().next().unwrap().unwrap_err();
    assert!(matches!(err, row::Error::UnterminatedQuoteError(_, 2)));
    assert_eq!(err.line(), Some(2));
}

#[test_log::test]
fn quote_inside_unquoted_field_is_literal() {
    let (_dir, source) = source(concat_line!(
        "email,height",
        "bob@x.com,6\"2",
        "alice@x.com,5",
    ));

    let rows = collect(&source);

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("height"), Some("6\"2"));
    assert_eq!(rows[1].get("email"), Some("alice@x.com"));
}

#[test_log::test]
fn quote_inside_unquoted_last_field() {
    let (_dir, source) = source("email,height\nalice@x.com,5\nbob@x.com,6\"2\n");

    let rows = collect(&source);

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].get("email"), Some("bob@x.com"));
    assert_eq!(rows[1].get("height"), Some("6\"2"));
}

#[test_log::test]
fn quoted_field_followed_by_text() {
    let (_dir, source) = source(concat_line!(
        "email,name",
        "alice@x.com,\"Alice\" Smith",
        "bob@x.com,Bob",
    ));

    let rows = collect(&source);

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("name"), Some("Alice Smith"));
    assert_eq!(rows[1].get("name"), Some("Bob"));
}

#[test_log::test]
fn unterminated_quote_in_single_row() {
    let (_dir, source) = source("email,name\nalice@x.com,\"Alice\n");

    let results: Vec<_> = source.rows().unwrap().collect();

    assert_eq!(results.len(), 1);
    let err = results.into_iter().next().unwrap().unwrap_err();
    assert!(matches!(err, row::Error::UnterminatedQuoteError(_, 2)));
}

#[test_log::test]
fn missing_data_source() {
    let source = RowSource::new(PathBuf::from("/this/data/source/does/not/exist.csv"));

    let err = source.rows().err().unwrap();

    assert!(matches!(err, row::Error::OpenDataSourceError(..)));
    assert!(err.to_string().contains("exist.csv"));
}

#[test_log::test]
fn rows_are_restartable() {
    let (_dir, source) = source("email\na@test.com\nb@test.com\n");

    let first = collect(&source);
    let second = collect(&source);

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}
