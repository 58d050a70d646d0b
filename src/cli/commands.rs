use anyhow::{Context, Result};
use bytes::Bytes;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::ds3::{
    BulkConfig, BulkJob, BulkJobResponse, BulkKind, BulkObject, BulkOrchestrator, Ds3Client,
    Ds3Error, HttpTransport, ListBucketOptions, TransferInstruction,
};

type Client = Ds3Client<HttpTransport>;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exponent = (bytes_f64.ln() / 1024_f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes_f64 / 1024_f64.powi(exponent as i32);

    if exponent == 0 {
        format!("{} {}", bytes, UNITS[exponent])
    } else {
        format!("{:.2} {}", value, UNITS[exponent])
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn progress_bar(total: usize, enabled: bool) -> Result<ProgressBar> {
    if !enabled {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.green/blue} {pos}/{len} blobs {msg}")?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

fn job_summary(job: &BulkJob) -> serde_json::Value {
    json!({
        "job_id": job.job_id(),
        "bucket": job.bucket(),
        "state": job.state(),
        "objects": job.submitted(),
        "blobs": job.pieces(),
        "remaining": job.remaining(),
    })
}

/// List all buckets
pub async fn cmd_service(client: &Client, json_output: bool) -> Result<()> {
    let service = client.get_service().await.context("Failed to list buckets")?;

    if json_output {
        return print_json(&service);
    }
    if let Some(owner) = &service.owner {
        println!("Owner: {} ({})", owner.display_name, owner.id);
    }
    for bucket in &service.buckets {
        println!(
            "{:<24}  {}",
            bucket.creation_date.as_deref().unwrap_or("-"),
            bucket.name
        );
    }
    if service.buckets.is_empty() {
        println!("No buckets found");
    }
    Ok(())
}

/// List objects in a bucket, following markers across pages
pub async fn cmd_ls(
    client: &Client,
    bucket: &str,
    prefix: Option<&str>,
    max_keys: Option<u32>,
    json_output: bool,
) -> Result<()> {
    let mut options = ListBucketOptions {
        prefix: prefix.map(str::to_string),
        max_keys,
        ..Default::default()
    };
    let mut objects = Vec::new();

    loop {
        let page = client
            .get_bucket(bucket, &options)
            .await
            .context(format!("Failed to list bucket '{}'", bucket))?;
        let last_key = page.objects.last().map(|o| o.name.clone());
        objects.extend(page.objects);

        if !page.is_truncated {
            break;
        }
        match page.next_marker.or(last_key) {
            Some(marker) => options.marker = Some(marker),
            None => break,
        }
    }

    if json_output {
        return print_json(&objects);
    }
    for object in &objects {
        println!(
            "{:<24}  {:>12}  {}",
            object.last_modified.as_deref().unwrap_or("-"),
            format_bytes(object.size),
            object.name
        );
    }
    if objects.is_empty() {
        println!("No objects found");
    }
    Ok(())
}

/// Make bucket command
pub async fn cmd_mb(client: &Client, bucket: &str) -> Result<()> {
    client.put_bucket(bucket).await?;
    println!("Bucket created: {}", bucket);
    Ok(())
}

/// Remove bucket command
pub async fn cmd_rb(client: &Client, bucket: &str) -> Result<()> {
    client.delete_bucket(bucket).await?;
    println!("Bucket deleted: {}", bucket);
    Ok(())
}

/// Upload a single file outside any job
pub async fn cmd_put(client: &Client, bucket: &str, file: &Path, key: Option<&str>) -> Result<()> {
    let key = match key {
        Some(k) => k.to_string(),
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context(format!("Not a file: {}", file.display()))?,
    };
    let data = tokio::fs::read(file)
        .await
        .context(format!("Failed to read {}", file.display()))?;
    let size = data.len() as u64;

    client.put_object(bucket, &key, Bytes::from(data)).await?;
    println!("Uploaded: {} -> {}/{} ({})", file.display(), bucket, key, format_bytes(size));
    Ok(())
}

/// Download a single object outside any job
pub async fn cmd_get(client: &Client, bucket: &str, key: &str, dest: &Path) -> Result<()> {
    let file = std::fs::File::create(dest)
        .context(format!("Failed to create {}", dest.display()))?;
    let mut writer = std::io::BufWriter::with_capacity(256 * 1024, file);
    client.get_object(bucket, key, &mut writer).await?;
    writer.flush()?;
    println!("Downloaded: {}/{} -> {}", bucket, key, dest.display());
    Ok(())
}

/// Delete a single object
pub async fn cmd_rm(client: &Client, bucket: &str, key: &str) -> Result<()> {
    client.delete_object(bucket, key).await?;
    println!("Deleted: {}/{}", bucket, key);
    Ok(())
}

/// Show object metadata
pub async fn cmd_stat(client: &Client, bucket: &str, key: &str, json_output: bool) -> Result<()> {
    let meta = client.head_object(bucket, key).await?;
    if json_output {
        return print_json(&meta);
    }
    println!("Object: {}/{}", bucket, key);
    if let Some(len) = meta.content_length {
        println!("  Size: {} ({} bytes)", format_bytes(len), len);
    }
    if let Some(etag) = &meta.etag {
        println!("  ETag: {}", etag);
    }
    for (name, value) in &meta.metadata {
        println!("  {}: {}", name, value);
    }
    Ok(())
}

/// Read `size` bytes at `offset` from a local file
///
/// The range is checked against the file length before anything is
/// allocated.
async fn read_blob(path: &Path, offset: u64, size: u64) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    let file_len = file.metadata().await?.len();
    let end = offset.checked_add(size).filter(|end| *end <= file_len).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "blob at offset {} with {} bytes is past the end of {} ({} bytes)",
                offset,
                size,
                path.display(),
                file_len
            ),
        )
    })?;
    let len = usize::try_from(end - offset)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Final size of each object in a GET plan: the end of its last piece
fn planned_sizes(plan: &BulkJobResponse) -> HashMap<String, u64> {
    let mut sizes: HashMap<String, u64> = HashMap::new();
    for object in plan.chunks.iter().flat_map(|c| c.objects.iter()) {
        let end = object.offset.saturating_add(object.size);
        let size = sizes.entry(object.name.clone()).or_insert(0);
        *size = (*size).max(end);
    }
    sizes
}

/// Create or truncate a download target and size it for all its pieces
fn prepare_target(path: &Path, size: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    file.set_len(size)
}

/// Upload local files with a bulk PUT job
pub async fn cmd_put_bulk(
    client: &Client,
    bulk: BulkConfig,
    bucket: &str,
    files: &[PathBuf],
    show_progress: bool,
    json_output: bool,
) -> Result<()> {
    let mut objects = Vec::with_capacity(files.len());
    let mut paths: HashMap<String, PathBuf> = HashMap::with_capacity(files.len());
    for file in files {
        let metadata = std::fs::metadata(file)
            .context(format!("Failed to read metadata for {}", file.display()))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context(format!("Not a file: {}", file.display()))?;
        if paths.insert(name.clone(), file.clone()).is_some() {
            anyhow::bail!("Two files map to the object name '{}'", name);
        }
        objects.push(BulkObject::new(name, metadata.len()));
    }

    let orchestrator = BulkOrchestrator::new(client.clone(), bulk);
    let job = orchestrator
        .start(BulkKind::Put, bucket, &objects)
        .await
        .context("Failed to start bulk put")?;
    tracing::info!(job_id = %job.job_id(), objects = objects.len(), "bulk_put_started");

    let pb = progress_bar(job.pieces(), show_progress)?;
    pb.set_message(format!("job {}", job.job_id()));
    let result = orchestrator
        .run(&job, |instruction: TransferInstruction| {
            let client = client.clone();
            let path = paths.get(&instruction.object.name).cloned();
            let pb = pb.clone();
            async move {
                let path = path.ok_or_else(|| {
                    Ds3Error::MissingArgument(format!(
                        "service assigned unknown object '{}'",
                        instruction.object.name
                    ))
                })?;
                let data = read_blob(&path, instruction.object.offset, instruction.object.size).await?;
                client.put_object_for_job(&instruction, data).await?;
                pb.inc(1);
                Ok(())
            }
        })
        .await;
    pb.finish_and_clear();

    finish_job(&job, result, json_output)
}

/// Download objects with a bulk GET job into `out_dir`
pub async fn cmd_get_bulk(
    client: &Client,
    bulk: BulkConfig,
    bucket: &str,
    names: &[String],
    out_dir: &Path,
    show_progress: bool,
    json_output: bool,
) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .context(format!("Failed to create output directory {}", out_dir.display()))?;
    let objects: Vec<BulkObject> = names.iter().map(|n| BulkObject::new(n.as_str(), 0)).collect();

    let orchestrator = BulkOrchestrator::new(client.clone(), bulk);
    let job = orchestrator
        .start(BulkKind::Get, bucket, &objects)
        .await
        .context("Failed to start bulk get")?;
    tracing::info!(job_id = %job.job_id(), objects = objects.len(), "bulk_get_started");

    // Pieces land at their offsets, so each target is truncated once up front
    for (name, size) in planned_sizes(job.plan()) {
        let target = out_dir.join(&name);
        prepare_target(&target, size)
            .context(format!("Failed to create {}", target.display()))?;
    }

    let pb = progress_bar(job.pieces(), show_progress)?;
    pb.set_message(format!("job {}", job.job_id()));

    let result = orchestrator
        .run(&job, |instruction: TransferInstruction| {
            let client = client.clone();
            let target = out_dir.join(&instruction.object.name);
            let pb = pb.clone();
            async move {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                // Sync writes are fine here; one file per transfer
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&target)?;
                file.seek(SeekFrom::Start(instruction.object.offset))?;
                let mut writer = std::io::BufWriter::with_capacity(256 * 1024, file);
                client.get_object_for_job(&instruction, &mut writer).await?;
                writer.flush()?;
                pb.inc(1);
                Ok(())
            }
        })
        .await;
    pb.finish_and_clear();

    finish_job(&job, result, json_output)
}

fn finish_job(job: &BulkJob, result: crate::ds3::Result<()>, json_output: bool) -> Result<()> {
    if let Err(e) = result {
        if json_output {
            print_json(&job_summary(job))?;
        }
        return Err(e).context(format!(
            "Bulk job {} stopped with {} of {} objects remaining",
            job.job_id(),
            job.remaining_count(),
            job.submitted()
        ));
    }

    if json_output {
        print_json(&job_summary(job))
    } else {
        println!("Job {} completed: {} objects", job.job_id(), job.submitted());
        Ok(())
    }
}

fn print_job(job: &BulkJobResponse) {
    println!("Job: {}", job.job_id);
    println!("  Bucket: {}", job.bucket_name.as_deref().unwrap_or("-"));
    if let Some(kind) = job.request_type {
        println!("  Type: {:?}", kind);
    }
    if let Some(status) = job.status {
        println!("  Status: {:?}", status);
    }
    if let Some(priority) = job.priority {
        println!("  Priority: {:?}", priority);
    }
    println!(
        "  Size: {} ({} completed, {} cached)",
        format_bytes(job.original_size_in_bytes),
        format_bytes(job.completed_size_in_bytes),
        format_bytes(job.cached_size_in_bytes)
    );
    if !job.chunks.is_empty() {
        println!("  Chunks: {} ({} objects)", job.chunks.len(), job.object_count());
    }
}

/// List jobs
pub async fn cmd_jobs(client: &Client, json_output: bool) -> Result<()> {
    let list = client.get_jobs().await.context("Failed to list jobs")?;
    if json_output {
        return print_json(&list);
    }
    for job in &list.jobs {
        print_job(job);
    }
    if list.jobs.is_empty() {
        println!("No jobs found");
    }
    Ok(())
}

/// Show one job
pub async fn cmd_job(client: &Client, job_id: &str, json_output: bool) -> Result<()> {
    let job = client
        .get_job(job_id)
        .await
        .context(format!("Failed to get job {}", job_id))?;
    if json_output {
        return print_json(&job);
    }
    print_job(&job);
    Ok(())
}

/// Cancel a job on the service
pub async fn cmd_cancel_job(client: &Client, job_id: &str) -> Result<()> {
    client
        .delete_job(job_id)
        .await
        .context(format!("Failed to cancel job {}", job_id))?;
    println!("Job cancelled: {}", job_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[tokio::test]
    async fn test_read_blob_range() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(read_blob(&path, 0, 10).await.unwrap(), Bytes::from_static(b"0123456789"));
        assert_eq!(read_blob(&path, 4, 3).await.unwrap(), Bytes::from_static(b"456"));
        assert!(read_blob(&path, 8, 5).await.is_err());
        // Rejected before any buffer is sized
        assert!(read_blob(&path, 0, u64::MAX).await.is_err());
        assert!(read_blob(&path, u64::MAX, 2).await.is_err());
    }

    #[test]
    fn test_planned_sizes_cover_every_piece() {
        let mut plan = BulkJobResponse::new("j".to_string());
        plan.chunks.push(crate::ds3::BulkObjectChunk {
            chunk_number: 1,
            server_id: "node2".to_string(),
            chunk_id: None,
            objects: vec![BulkObject {
                offset: 10,
                ..BulkObject::new("big.bin", 6)
            }],
        });
        plan.chunks.push(crate::ds3::BulkObjectChunk {
            chunk_number: 0,
            server_id: "node1".to_string(),
            chunk_id: None,
            objects: vec![BulkObject::new("big.bin", 10), BulkObject::new("small", 3)],
        });

        let sizes = planned_sizes(&plan);
        assert_eq!(sizes.get("big.bin"), Some(&16));
        assert_eq!(sizes.get("small"), Some(&3));
    }

    #[test]
    fn test_prepare_target_drops_stale_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out.bin");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![b'x'; 64]).unwrap();

        prepare_target(&path, 16).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);

        let fresh = dir.path().join("other").join("new.bin");
        prepare_target(&fresh, 4).unwrap();
        assert_eq!(std::fs::read(&fresh).unwrap(), vec![0u8; 4]);
    }
}
