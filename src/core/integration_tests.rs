//! 集成测试模块
//! 测试下载池、工作者、命名与合并步骤之间的完整工作流程

#[cfg(test)]
mod tests {
    use crate::core::{
        models::{AppResult, JobRequest, JobState, OutputFormat, Resolution},
        remux::Remuxer,
        runtime::{spawn_pool, PoolHandle, PoolSettings},
        test_support::{
            dir_listing, sample_info, wait_for_job, wait_terminal, StubBackend, StubRemuxer,
        },
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn pool_with(backend: Arc<StubBackend>, remuxer: Arc<dyn Remuxer>, slots: usize) -> PoolHandle {
        let (handle, _events) = spawn_pool(backend, remuxer, PoolSettings::default().with_slots(slots));
        handle
    }

    #[tokio::test]
    async fn test_mp3_job_produces_single_titled_file() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(sample_info("Song")));
        let remuxer = Arc::new(StubRemuxer::new());
        let handle = pool_with(backend, remuxer.clone(), 1);

        let request = JobRequest::new("https://media.test/song", OutputFormat::Mp3, dir.path())
            .with_bitrate(Some(320));
        let id = handle.submit(request).await?;
        let job = wait_terminal(&handle, &id).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.title.as_deref(), Some("Song"));
        assert_eq!(job.output_path, Some(dir.path().join("Song.mp3")));
        assert_eq!(dir_listing(dir.path()), vec!["Song.mp3".to_string()]);

        let specs = remuxer.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].audio_bitrate, Some(320));
        assert_eq!(specs[0].inputs.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_mp4_with_audio_merges_two_streams() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(sample_info("Talk")).with_chunks(2, 100));
        let remuxer = Arc::new(StubRemuxer::new());
        let handle = pool_with(backend, remuxer.clone(), 1);

        let request = JobRequest::new("https://media.test/talk", OutputFormat::Mp4WithAudio, dir.path())
            .with_resolution(Resolution::MaxHeight(1080));
        let id = handle.submit(request).await?;
        let job = wait_terminal(&handle, &id).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(dir_listing(dir.path()), vec!["Talk.mp4".to_string()]);
        assert_eq!(std::fs::metadata(dir.path().join("Talk.mp4"))?.len(), 400);
        assert_eq!(remuxer.specs()[0].inputs.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_video_only_mp4_is_renamed_without_remux() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let remuxer = Arc::new(StubRemuxer::new());
        let handle = pool_with(Arc::new(StubBackend::new(sample_info("Silent"))), remuxer.clone(), 1);

        let id = handle
            .submit(JobRequest::new("https://media.test/s", OutputFormat::Mp4WithoutAudio, dir.path()))
            .await?;
        let job = wait_terminal(&handle, &id).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(remuxer.calls(), 0);
        assert_eq!(dir_listing(dir.path()), vec!["Silent.mp4".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_explicit_filename_and_template() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let handle = pool_with(
            Arc::new(StubBackend::new(sample_info("Ignored"))),
            Arc::new(StubRemuxer::new()),
            2,
        );

        let named = handle
            .submit(
                JobRequest::new("https://media.test/n", OutputFormat::Mp3, dir.path())
                    .with_filename(Some("my song.mp3".into())),
            )
            .await?;
        let templated = handle
            .submit(
                JobRequest::new("https://media.test/t", OutputFormat::Mp3, dir.path())
                    .with_output_template(Some("music/%(id)s.%(ext)s".into())),
            )
            .await?;

        assert_eq!(
            wait_terminal(&handle, &named).await.output_path,
            Some(dir.path().join("my song.mp3"))
        );
        assert_eq!(
            wait_terminal(&handle, &templated).await.output_path,
            Some(dir.path().join("music").join("stub123.mp3"))
        );
        Ok(())
    }

    /// 两个同名任务并发运行，返回排序后的输出路径
    async fn run_two_named_video_jobs(dir: &std::path::Path) -> AppResult<Vec<std::path::PathBuf>> {
        let backend = Arc::new(
            StubBackend::new(sample_info("Any"))
                .with_chunks(4, 128)
                .with_delay(Duration::from_millis(10)),
        );
        let handle = pool_with(backend.clone(), Arc::new(StubRemuxer::new()), 2);

        let mut ids = Vec::new();
        for i in 0..2 {
            let request = JobRequest::new(format!("https://media.test/v{}", i), OutputFormat::Mp4WithoutAudio, dir)
                .with_filename(Some("video".into()));
            ids.push(handle.submit(request).await?);
        }

        let mut outputs = Vec::new();
        for id in &ids {
            let job = wait_terminal(&handle, id).await;
            assert_eq!(job.state, JobState::Completed);
            outputs.extend(job.output_path);
        }
        // 两个任务确实同时运行
        assert_eq!(backend.max_concurrency(), 2);
        outputs.sort();
        Ok(outputs)
    }

    #[tokio::test]
    async fn test_concurrent_same_name_jobs_skip_existing_file() -> AppResult<()> {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("video.mp4"), b"existing")?;

        let outputs = run_two_named_video_jobs(dir.path()).await?;

        assert_eq!(
            outputs,
            vec![dir.path().join("video (1).mp4"), dir.path().join("video (2).mp4")]
        );
        assert_eq!(
            dir_listing(dir.path()),
            vec!["video (1).mp4", "video (2).mp4", "video.mp4"]
        );
        assert_eq!(std::fs::read(dir.path().join("video.mp4"))?, b"existing");
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_same_name_jobs_without_existing_file() -> AppResult<()> {
        let dir = tempdir().unwrap();

        let outputs = run_two_named_video_jobs(dir.path()).await?;

        assert_eq!(
            outputs,
            vec![dir.path().join("video (1).mp4"), dir.path().join("video.mp4")]
        );
        assert_eq!(dir_listing(dir.path()), vec!["video (1).mp4", "video.mp4"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_mid_download_leaves_no_files() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let backend = Arc::new(
            StubBackend::new(sample_info("Long"))
                .with_chunks(200, 1024)
                .with_delay(Duration::from_millis(5)),
        );
        let handle = pool_with(backend, Arc::new(StubRemuxer::new()), 1);

        let id = handle
            .submit(JobRequest::new("https://media.test/long", OutputFormat::Mp4WithAudio, dir.path()))
            .await?;
        wait_for_job(&handle, &id, |job| job.progress.bytes_done > 0).await;
        assert!(!dir_listing(dir.path()).is_empty());

        handle.cancel(&id).await?;
        let job = wait_terminal(&handle, &id).await;

        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.output_path.is_none());
        assert!(dir_listing(dir.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_while_paused() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let backend = Arc::new(
            StubBackend::new(sample_info("Held"))
                .with_chunks(200, 1024)
                .with_delay(Duration::from_millis(5)),
        );
        let handle = pool_with(backend, Arc::new(StubRemuxer::new()), 1);

        let id = handle
            .submit(JobRequest::new("https://media.test/held", OutputFormat::Mkv, dir.path()))
            .await?;
        wait_for_job(&handle, &id, |job| job.progress.bytes_done > 0).await;
        handle.pause(&id).await?;
        wait_for_job(&handle, &id, |job| job.state == JobState::Paused).await;

        handle.cancel(&id).await?;
        assert_eq!(wait_terminal(&handle, &id).await.state, JobState::Cancelled);
        assert!(dir_listing(dir.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_failure_keeps_intermediates() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let handle = pool_with(
            Arc::new(StubBackend::new(sample_info("Broken"))),
            Arc::new(StubRemuxer::failing("Conversion failed!")),
            1,
        );

        let id = handle
            .submit(JobRequest::new("https://media.test/b", OutputFormat::Mp4WithAudio, dir.path()))
            .await?;
        let job = wait_terminal(&handle, &id).await;

        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.as_deref().unwrap_or_default().contains("Conversion failed!"));
        // 合并失败时保留已下载的流，删除不完整的输出
        assert_eq!(
            dir_listing(dir.path()),
            vec!["Broken.f137.mp4".to_string(), "Broken.f251.webm".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_job_does_not_affect_siblings() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let backend = Arc::new(
            StubBackend::new(sample_info("Clip"))
                .with_chunks(4, 256)
                .with_delay(Duration::from_millis(10))
                .failing_url("broken"),
        );
        let handle = pool_with(backend, Arc::new(StubRemuxer::new()), 2);

        let broken = handle
            .submit(JobRequest::new("https://media.test/broken", OutputFormat::Mp4WithoutAudio, dir.path()))
            .await?;
        let healthy = handle
            .submit(JobRequest::new("https://media.test/fine", OutputFormat::Mp4WithoutAudio, dir.path()))
            .await?;

        let broken = wait_terminal(&handle, &broken).await;
        let healthy = wait_terminal(&handle, &healthy).await;

        assert_eq!(broken.state, JobState::Failed);
        assert!(broken.error.as_deref().unwrap_or_default().contains("500"));
        assert_eq!(healthy.state, JobState::Completed);

        let listing = dir_listing(dir.path());
        assert_eq!(listing.len(), 1);
        assert!(healthy
            .output_path
            .as_ref()
            .and_then(|p| p.file_name())
            .is_some_and(|name| listing[0] == name.to_string_lossy()));
        Ok(())
    }

    #[tokio::test]
    async fn test_forbidden_fetch_is_retried_with_alternate_headers() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(sample_info("Guarded")).forbid_fetches(1));
        let handle = pool_with(backend.clone(), Arc::new(StubRemuxer::new()), 1);

        let id = handle
            .submit(JobRequest::new("https://media.test/g", OutputFormat::Mp4WithoutAudio, dir.path()))
            .await?;
        let job = wait_terminal(&handle, &id).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(backend.fetch_calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_failure_marks_job_failed() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let backend = Arc::new(
            StubBackend::new(sample_info("Gone")).failing_resolve("ERROR: Video unavailable"),
        );
        let handle = pool_with(backend.clone(), Arc::new(StubRemuxer::new()), 1);

        let id = handle
            .submit(JobRequest::new("https://media.test/gone", OutputFormat::Mp3, dir.path()))
            .await?;
        let job = wait_terminal(&handle, &id).await;

        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.as_deref().unwrap_or_default().contains("Video unavailable"));
        assert_eq!(backend.fetch_calls(), 0);
        assert!(dir_listing(dir.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_destination_is_created() -> AppResult<()> {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let handle = pool_with(
            Arc::new(StubBackend::new(sample_info("Deep"))),
            Arc::new(StubRemuxer::new()),
            1,
        );

        let id = handle
            .submit(JobRequest::new("https://media.test/d", OutputFormat::Mp3, &nested))
            .await?;
        assert_eq!(
            wait_terminal(&handle, &id).await.output_path,
            Some(nested.join("Deep.mp3"))
        );
        Ok(())
    }
}
