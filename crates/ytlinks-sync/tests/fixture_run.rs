use std::path::{Path, PathBuf};
use std::time::Duration;

use ytlinks_sync::{pipeline_from_config, read_csv_table, RunRequest, SyncConfig, ViewsInput};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn fixture_site_run_produces_wide_table() {
    let out = tempfile::tempdir().expect("tempdir");
    let root = workspace_root();
    let config = SyncConfig {
        max_workers: 3,
        max_retries: 2,
        retry_base_delay: Duration::ZERO,
        request_delay: Duration::ZERO,
        fixtures_dir: Some(root.join("fixtures/youtube-sample/sample")),
        output_dir: out.path().to_path_buf(),
        workspace_root: root.clone(),
        ..SyncConfig::default()
    };

    let input = out.path().join("aliases.csv");
    std::fs::write(
        &input,
        "alias,owner\nrealchannel,ops\ndoesnotexist123xyz,ops\ncooking with sam,food\n",
    )
    .unwrap();
    let views = out.path().join("views.csv");
    std::fs::write(
        &views,
        "alias,avg_views\nrealchannel,250000\ncooking with sam,4999\ndoesnotexist123xyz,\n",
    )
    .unwrap();

    let pipeline = pipeline_from_config(config).expect("pipeline");
    let summary = pipeline
        .run_once(&RunRequest {
            input,
            column: "alias".into(),
            views: Some(ViewsInput {
                path: views,
                key_column: "alias".into(),
                views_column: "avg_views".into(),
            }),
        })
        .await
        .expect("run");

    assert_eq!(summary.input_rows, 3);
    assert_eq!(summary.channels_found, 2);
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.resolution_errors, 0);
    assert_eq!(summary.links_found, 7);

    let run_dir = PathBuf::from(&summary.run_dir);
    let wide = read_csv_table(&run_dir.join("social_links_wide.csv")).expect("wide table");
    assert_eq!(wide.len(), 3);
    for platform in ["Email", "Instagram", "Telegram", "TikTok", "X (Twitter)", "YouTube Channel"] {
        assert!(wide.has_column(platform), "missing {platform} column");
    }

    let cell = |alias: &str, column: &str| {
        wide.rows
            .iter()
            .find(|row| row.get("alias").map(String::as_str) == Some(alias))
            .and_then(|row| row.get(column).cloned())
    };
    assert_eq!(
        cell("realchannel", "Instagram").as_deref(),
        Some("https://www.instagram.com/realchannel")
    );
    assert_eq!(cell("realchannel", "engagement_category").as_deref(), Some("250k-1M"));
    assert_eq!(
        cell("cooking with sam", "channel_url").as_deref(),
        Some("https://www.youtube.com/@SamCooksDaily")
    );
    assert_eq!(cell("cooking with sam", "engagement_category").as_deref(), Some("< 5k"));
    assert_eq!(cell("doesnotexist123xyz", "channel_url").as_deref(), Some("Not Found"));
    assert_eq!(cell("doesnotexist123xyz", "extraction_status").as_deref(), Some("skipped"));
    assert_eq!(cell("doesnotexist123xyz", "engagement_category").as_deref(), Some("N/A"));

    let links = read_csv_table(&run_dir.join("social_links.csv")).expect("long table");
    assert_eq!(links.len(), 7);
    assert!(links.rows.iter().all(|row| row
        .get("channel_url")
        .is_some_and(|url| url.starts_with("https://www.youtube.com/@"))));
}
