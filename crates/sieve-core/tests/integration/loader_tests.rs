use std::collections::HashSet;

use sieve_core::{Field, RemovalSets, SourceLoader, StreamingLoader, load_sources};

use crate::common::{rec, write_file};

#[tokio::test]
async fn last_occurrence_wins_within_a_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_file(
        dir.path(),
        "source.txt",
        "a@x.com:p1\na@x.com:p2\nb@x.com;p3\n",
    );

    let chunk = StreamingLoader::new()
        .load_source(&source, &RemovalSets::new(), 100)
        .await
        .unwrap();

    assert_eq!(chunk.len(), 2);
    assert_eq!(chunk.get("a@x.com"), Some(&rec("a@x.com", "p2")));
    assert_eq!(chunk.get("b@x.com"), Some(&rec("b@x.com", "p3")));
}

#[tokio::test]
async fn malformed_lines_are_dropped_silently() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_file(
        dir.path(),
        "source.txt",
        "no delimiter\n:empty-key\nempty-secret;\n\r\nc@x.com:ok\r\n",
    );

    let chunk = StreamingLoader::new()
        .load_source(&source, &RemovalSets::new(), 100)
        .await
        .unwrap();

    assert_eq!(chunk.into_records(), vec![rec("c@x.com", "ok")]);
}

#[tokio::test]
async fn exact_removal_drops_key_regardless_of_secret() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_file(
        dir.path(),
        "source.txt",
        "a@x.com:p1\nb@x.com:p2\nc@x.com:p3\n",
    );
    let known = write_file(dir.path(), "known.txt", "a@x.com\nc@x.com;other\n");
    let removal = RemovalSets::new().with_exact(&known);

    let chunk = StreamingLoader::new()
        .load_source(&source, &removal, 100)
        .await
        .unwrap();

    let keys: Vec<&str> = chunk.iter().map(|r| r.key()).collect();
    assert_eq!(keys, vec!["b@x.com"]);
}

#[tokio::test]
async fn exact_removal_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_file(
        dir.path(),
        "source.txt",
        "a@x.com:p1\nb@x.com:p2\nc@x.com:p3\n",
    );
    let known = write_file(dir.path(), "known.txt", "b@x.com\n");

    let once = RemovalSets::new().with_exact(&known);
    let twice = RemovalSets::new().with_exact(&known).with_exact(&known);
    let loader = StreamingLoader::new();

    let a = loader.load_source(&source, &once, 100).await.unwrap();
    let b = loader.load_source(&source, &twice, 100).await.unwrap();
    assert_eq!(a.into_records(), b.into_records());
}

#[tokio::test]
async fn fuzzy_removal_matches_emails_case_insensitively() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_file(
        dir.path(),
        "source.txt",
        "a@x.com:p1\nb@x.com:p2\nc@x.com:p3\n",
    );
    let log = write_file(
        dir.path(),
        "log.txt",
        "2024-01-01 login ok for A@X.COM from 10.0.0.1\nnothing else\n",
    );
    let removal = RemovalSets::new().with_fuzzy(&log);

    let chunk = StreamingLoader::new()
        .load_source(&source, &removal, 100)
        .await
        .unwrap();

    let keys: HashSet<&str> = chunk.iter().map(|r| r.key()).collect();
    assert_eq!(keys, HashSet::from(["b@x.com", "c@x.com"]));
}

#[tokio::test]
async fn fuzzy_removal_on_secret_uses_substring() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_file(dir.path(), "source.txt", "a@x.com:hunter2\nb@x.com:s3cret\n");
    let log = write_file(dir.path(), "log.txt", "tried password hunter2 yesterday\n");
    let removal = RemovalSets::new()
        .with_fuzzy(&log)
        .with_fuzzy_field(Field::Secret);

    let chunk = StreamingLoader::new()
        .load_source(&source, &removal, 100)
        .await
        .unwrap();

    assert_eq!(chunk.into_records(), vec![rec("b@x.com", "s3cret")]);
}

#[tokio::test]
async fn legacy_files_act_as_exact_removal() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_file(dir.path(), "source.txt", "a@x.com:p1\nb@x.com:p2\n");
    let legacy = write_file(dir.path(), "legacy.txt", "a@x.com:whatever\n");
    let removal = RemovalSets::new().with_legacy(&legacy);

    let chunk = StreamingLoader::new()
        .load_source(&source, &removal, 100)
        .await
        .unwrap();

    assert_eq!(chunk.into_records(), vec![rec("b@x.com", "p2")]);
}

#[tokio::test]
async fn missing_removal_file_aborts_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_file(dir.path(), "source.txt", "a@x.com:p1\n");
    let removal = RemovalSets::new().with_exact(dir.path().join("missing.txt"));

    let result = StreamingLoader::new()
        .load_source(&source, &removal, 100)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn single_source_is_capped_at_max_records() {
    let dir = tempfile::tempdir().unwrap();
    let content: String = (0..500).map(|i| format!("u{i}@x.com:p{i}\n")).collect();
    let source = write_file(dir.path(), "source.txt", &content);

    let chunk = StreamingLoader::new()
        .load_source(&source, &RemovalSets::new(), 40)
        .await
        .unwrap();

    assert_eq!(chunk.len(), 40);
    assert_eq!(chunk.iter().next().map(|r| r.key()), Some("u0@x.com"));
}

#[tokio::test]
async fn filtering_happens_before_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let content: String = (0..50).map(|i| format!("u{i}@x.com:p{i}\n")).collect();
    let source = write_file(dir.path(), "source.txt", &content);
    let known: String = (0..10).map(|i| format!("u{i}@x.com\n")).collect();
    let known = write_file(dir.path(), "known.txt", &known);

    let chunk = StreamingLoader::new()
        .load_source(&source, &RemovalSets::new().with_exact(&known), 10)
        .await
        .unwrap();

    let keys: Vec<String> = chunk.iter().map(|r| r.key().to_string()).collect();
    let expected: Vec<String> = (10..20).map(|i| format!("u{i}@x.com")).collect();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn multiple_sources_never_exceed_max_total() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_file(dir.path(), "a.txt", "a1@x.com:1\na2@x.com:2\na3@x.com:3\n");
    let b = write_file(dir.path(), "b.txt", "b1@x.com:1\nb2@x.com:2\nb3@x.com:3\n");
    let c = write_file(dir.path(), "c.txt", "c1@x.com:1\n");
    let loader = StreamingLoader::new();

    for max_total in [1, 3, 4, 6, 7, 100] {
        let records = load_sources(
            &loader,
            &[a.clone(), b.clone(), c.clone()],
            &RemovalSets::new(),
            max_total,
        )
        .await
        .unwrap();
        assert!(records.len() <= max_total, "max_total {max_total}");
        assert_eq!(records.len(), max_total.min(7));
    }

    let records = load_sources(&loader, &[a, b, c], &RemovalSets::new(), 4)
        .await
        .unwrap();
    let keys: Vec<&str> = records.iter().map(|r| r.key()).collect();
    assert_eq!(keys, vec!["a1@x.com", "a2@x.com", "a3@x.com", "b1@x.com"]);
}

#[cfg(unix)]
mod helper {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use sieve_core::{Loader, RemovalSets, SourceLoader};

    use crate::common::{rec, write_file};

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = write_file(dir, "helper.sh", &format!("#!/bin/sh\n{body}"));
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn helper_output_between_sentinels_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let script = write_script(
            dir.path(),
            &format!(
                "echo \"$@\" > {}\n\
                 echo 'reading source'\n\
                 echo 'not:a record'\n\
                 echo '!PrintingLines!'\n\
                 echo 'a@x.com:p1'\n\
                 echo 'broken line'\n\
                 echo 'b@x.com;p2'\n\
                 echo '!WorkFinished!'\n\
                 echo 'c@x.com:ignored'\n",
                args_file.display()
            ),
        );
        let source = write_file(dir.path(), "source.txt", "");
        let removal = RemovalSets::new()
            .with_exact("/k/exact.txt")
            .with_fuzzy("/k/fuzzy.txt")
            .with_legacy("/k/legacy.txt");

        let loader = Loader::detect(&script);
        assert!(loader.is_delegated());
        let chunk = loader.load_source(&source, &removal, 50).await.unwrap();

        assert_eq!(
            chunk.into_records(),
            vec![rec("a@x.com", "p1"), rec("b@x.com", "p2")]
        );
        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            args.trim_end(),
            format!(
                "0 50 {} v1|/k/exact.txt v2|/k/fuzzy.txt v3|/k/legacy.txt",
                source.display()
            )
        );
    }

    #[tokio::test]
    async fn helper_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo '!PrintingLines!'\nexit 3\n");
        let source = write_file(dir.path(), "source.txt", "");

        let result = Loader::detect(&script)
            .load_source(&source, &RemovalSets::new(), 10)
            .await;
        assert!(result.is_err());
    }
}
