mod support;

use anyhow::Result;
use http::{HeaderMap, StatusCode};

use htcache::cache::CacheState;
use htcache::proxy::{Conditional, Phase, TransactionError};
use htcache::store::{Descriptor, Resource};

use support::*;

/// Runs a full fetch of `url` with the given response headers and body.
async fn store_object(
    cache: &TestCache,
    url: &str,
    response: &HeaderMap,
    body: &[u8],
) -> Result<CacheState> {
    let mut tx = cache.ctx.transaction(url);
    tx.init_cache().await?;
    tx.init_data()?;
    tx.prepare_request(&mut HeaderMap::new())?;
    tx.finish_request(StatusCode::OK, response).await?;
    tx.prepare_response(&mut HeaderMap::new())?;
    tx.append(body).await?;
    let state = tx.finish_body().await?;
    tx.close();
    Ok(state)
}

#[tokio::test]
async fn cache_and_descriptor_bind_the_same_key() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("//example.org/index.html");
    tx.init_cache().await?;
    tx.init_data()?;

    assert_eq!(tx.phase(), Phase::DataBound);
    let key = tx.cache().expect("cache bound").path().to_string();
    assert_eq!(key, "example.org/index.html");
    let descriptor = tx.descriptor().expect("descriptor bound");
    assert_eq!(descriptor.path, key);
    assert!(!descriptor.is_stored());
    Ok(())
}

#[tokio::test]
async fn directory_urls_map_to_index_files() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("//example.org/docs/");
    tx.init_cache().await?;
    assert_eq!(tx.cache().unwrap().path(), "example.org/docs/index");
    Ok(())
}

#[tokio::test]
async fn urls_without_network_path_marker_are_rejected() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("http://example.org/");
    let err = tx.init_cache().await.unwrap_err();
    assert!(matches!(err, TransactionError::MalformedUrl { .. }));
    assert_eq!(tx.phase(), Phase::Init);
    Ok(())
}

#[tokio::test]
async fn operations_out_of_order_are_phase_errors() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("//example.org/a");
    let err = tx.prepare_request(&mut HeaderMap::new()).unwrap_err();
    assert!(matches!(
        err,
        TransactionError::Phase {
            operation: "prepare_request",
            phase: "init"
        }
    ));
    Ok(())
}

#[tokio::test]
async fn client_range_requests_are_refused() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("//example.org/a");
    tx.init_cache().await?;
    tx.init_data()?;
    let mut request = headers(&[("range", "bytes=0-99")]);
    let err = tx.prepare_request(&mut request).unwrap_err();
    assert!(matches!(err, TransactionError::ClientRange { .. }));
    Ok(())
}

#[tokio::test]
async fn fresh_fetch_strips_client_headers_and_adds_via() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("//example.org/a");
    tx.init_cache().await?;
    tx.init_data()?;
    let mut request = headers(&[
        ("accept-encoding", "gzip"),
        ("cache-control", "no-cache"),
        ("x-relationship", "stylesheet"),
        ("referer", "http://example.org/"),
        ("via", "1.0 client-proxy"),
    ]);
    tx.prepare_request(&mut request)?;

    assert_eq!(tx.conditional(), Conditional::None);
    for stripped in [
        "accept-encoding",
        "cache-control",
        "x-relationship",
        "range",
        "if-range",
        "if-modified-since",
        "if-none-match",
    ] {
        assert!(request.get(stripped).is_none(), "{stripped} should be absent");
    }
    assert_eq!(
        header(&request, "via"),
        Some("1.0 client-proxy, 1.1 proxy.test:8080")
    );
    assert_eq!(header(&request, "referer"), Some("http://example.org/"));
    Ok(())
}

#[tokio::test]
async fn stored_object_is_revalidated_and_served_on_304() -> Result<()> {
    let cache = TestCache::new()?;
    let response = headers(&[
        ("content-length", "11"),
        ("content-type", "text/plain; charset=utf-8"),
        ("last-modified", LAST_MODIFIED),
        ("etag", "\"v1\""),
        ("server", "upstream"),
    ]);

    let mut tx = cache.ctx.transaction("//example.org/hello.txt");
    tx.init_cache().await?;
    tx.init_data()?;
    tx.prepare_request(&mut HeaderMap::new())?;
    tx.finish_request(StatusCode::OK, &response).await?;
    let mut downstream = HeaderMap::new();
    tx.prepare_response(&mut downstream)?;
    assert!(tx.durable());
    assert_eq!(header(&downstream, "content-length"), Some("11"));
    assert_eq!(
        header(&downstream, "content-type"),
        Some("text/plain; charset=utf-8")
    );
    assert_eq!(header(&downstream, "etag"), Some("\"v1\""));
    assert_eq!(header(&downstream, "last-modified"), Some(LAST_MODIFIED));
    assert_eq!(header(&downstream, "connection"), Some("close"));
    assert_eq!(header(&downstream, "via"), Some(VIA_TOKEN));
    assert!(header(&downstream, "server").is_none());

    tx.append(b"hello world").await?;
    assert_eq!(tx.finish_body().await?, CacheState::Full);
    tx.close();
    assert_eq!(tx.phase(), Phase::Closed);

    let store = &cache.ctx.store;
    assert_eq!(store.resources()?.len(), 1);
    let descriptor = store.fetch(&Descriptor::by_path("example.org/hello.txt"))?;
    assert_eq!(descriptor.size, Some(11));
    assert_eq!(descriptor.mediatype.as_deref(), Some("text/plain"));
    assert_eq!(descriptor.charset.as_deref(), Some("utf-8"));
    assert_eq!(descriptor.etag.as_deref(), Some("v1"));
    let resource = store.fetch(&Resource::by_url("//example.org/hello.txt"))?;
    assert_eq!(descriptor.resource_id, resource.id());

    let mut tx = cache.ctx.transaction("//example.org/hello.txt");
    tx.init_cache().await?;
    tx.init_data()?;
    assert!(tx.descriptor().unwrap().is_stored());
    let mut request = HeaderMap::new();
    tx.prepare_request(&mut request)?;
    assert_eq!(tx.conditional(), Conditional::Revalidate);
    assert_eq!(header(&request, "if-modified-since"), Some(LAST_MODIFIED));
    assert_eq!(header(&request, "if-none-match"), Some("\"v1\""));
    assert!(request.get("range").is_none());
    assert!(request.get("if-range").is_none());

    tx.finish_request(StatusCode::NOT_MODIFIED, &HeaderMap::new())
        .await?;
    assert!(tx.served_from_cache());
    let mut downstream = HeaderMap::new();
    tx.prepare_response(&mut downstream)?;
    assert!(!tx.durable());
    assert_eq!(header(&downstream, "content-length"), Some("11"));

    let mut buf = [0u8; 32];
    let read = tx.read(&mut buf).await?;
    assert_eq!(&buf[..read], b"hello world");
    tx.close();

    assert_eq!(store.descriptors()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn interrupted_download_resumes_with_range_request() -> Result<()> {
    let cache = TestCache::new()?;
    let first = headers(&[("content-length", "10"), ("last-modified", LAST_MODIFIED)]);
    let state = store_object(&cache, "//example.org/big.bin", &first, b"01234").await?;
    assert_eq!(state, CacheState::Partial);
    assert!(cache.dirs.object("example.org/big.bin.incomplete").exists());
    assert!(!cache.dirs.object("example.org/big.bin").exists());

    let mut tx = cache.ctx.transaction("//example.org/big.bin");
    tx.init_cache().await?;
    tx.init_data()?;
    assert!(tx.cache().unwrap().partial());
    let mut request = HeaderMap::new();
    tx.prepare_request(&mut request)?;
    assert_eq!(tx.conditional(), Conditional::Resume);
    assert_eq!(header(&request, "range"), Some("bytes=5-"));
    assert_eq!(header(&request, "if-range"), Some(LAST_MODIFIED));
    assert!(request.get("if-modified-since").is_none());

    let resumed = headers(&[
        ("content-length", "5"),
        ("content-range", "bytes 5-9/10"),
        ("last-modified", LAST_MODIFIED),
    ]);
    tx.finish_request(StatusCode::PARTIAL_CONTENT, &resumed)
        .await?;
    let mut downstream = HeaderMap::new();
    tx.prepare_response(&mut downstream)?;
    assert_eq!(header(&downstream, "content-length"), Some("10"));
    tx.append(b"56789").await?;
    assert_eq!(tx.finish_body().await?, CacheState::Full);
    tx.close();

    assert_eq!(
        std::fs::read(cache.dirs.object("example.org/big.bin"))?,
        b"0123456789"
    );
    assert!(!cache.dirs.object("example.org/big.bin.incomplete").exists());
    let descriptor = cache
        .ctx
        .store
        .fetch(&Descriptor::by_path("example.org/big.bin"))?;
    assert_eq!(descriptor.size, Some(10));
    Ok(())
}

#[tokio::test]
async fn refused_resume_restarts_the_download() -> Result<()> {
    let cache = TestCache::new()?;
    let first = headers(&[("content-length", "10"), ("last-modified", LAST_MODIFIED)]);
    store_object(&cache, "//example.org/big.bin", &first, b"stale").await?;

    let mut tx = cache.ctx.transaction("//example.org/big.bin");
    tx.init_cache().await?;
    tx.init_data()?;
    tx.prepare_request(&mut HeaderMap::new())?;
    let full = headers(&[("content-length", "4")]);
    tx.finish_request(StatusCode::OK, &full).await?;
    tx.prepare_response(&mut HeaderMap::new())?;
    tx.append(b"new!").await?;
    assert_eq!(tx.finish_body().await?, CacheState::Full);
    tx.close();

    assert_eq!(std::fs::read(cache.dirs.object("example.org/big.bin"))?, b"new!");
    let descriptor = cache
        .ctx
        .store
        .fetch(&Descriptor::by_path("example.org/big.bin"))?;
    assert_eq!(descriptor.size, Some(4));
    assert_eq!(cache.ctx.store.descriptors()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn pending_descriptor_path_moves_a_new_object() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("//example.org/a");
    tx.init_cache().await?;
    tx.init_data()?;
    tx.descriptor_mut().unwrap().path = "mirror/example.org/a".to_string();
    tx.prepare_request(&mut HeaderMap::new())?;
    tx.finish_request(StatusCode::OK, &headers(&[("content-length", "3")]))
        .await?;
    assert_eq!(tx.cache().unwrap().path(), "mirror/example.org/a");
    tx.prepare_response(&mut HeaderMap::new())?;
    tx.append(b"abc").await?;
    tx.finish_body().await?;
    tx.close();

    assert_eq!(std::fs::read(cache.dirs.object("mirror/example.org/a"))?, b"abc");
    assert!(!cache.dirs.object("example.org/a").exists());
    Ok(())
}

#[tokio::test]
async fn partial_objects_cannot_be_moved() -> Result<()> {
    let cache = TestCache::new()?;
    cache
        .dirs
        .write_object("example.org/part.bin.incomplete", 5)?;

    let mut tx = cache.ctx.transaction("//example.org/part.bin");
    tx.init_cache().await?;
    tx.init_data()?;
    tx.descriptor_mut().unwrap().path = "elsewhere/part.bin".to_string();
    tx.prepare_request(&mut HeaderMap::new())?;
    let err = tx
        .finish_request(StatusCode::OK, &headers(&[("content-length", "10")]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransactionError::OpaqueMove {
            state: "partial",
            ..
        }
    ));
    assert!(cache.dirs.object("example.org/part.bin.incomplete").exists());
    Ok(())
}

#[tokio::test]
async fn second_writer_for_a_key_is_refused() -> Result<()> {
    let cache = TestCache::new()?;
    let response = headers(&[("content-length", "3")]);

    let mut first = cache.ctx.transaction("//example.org/shared");
    first.init_cache().await?;
    first.init_data()?;
    first.prepare_request(&mut HeaderMap::new())?;

    let mut second = cache.ctx.transaction("//example.org/shared");
    second.init_cache().await?;
    second.init_data()?;
    second.prepare_request(&mut HeaderMap::new())?;

    first.finish_request(StatusCode::OK, &response).await?;
    assert!(cache.ctx.locks.is_held("example.org/shared"));
    let err = second
        .finish_request(StatusCode::OK, &response)
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::KeyBusy { .. }));

    first.close();
    second.close();
    assert!(cache.ctx.locks.is_empty());
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent_and_runs_on_drop() -> Result<()> {
    let cache = TestCache::new()?;
    {
        let mut tx = cache.ctx.transaction("//example.org/dropped");
        tx.init_cache().await?;
        tx.init_data()?;
        tx.prepare_request(&mut HeaderMap::new())?;
        tx.finish_request(StatusCode::OK, &headers(&[("content-length", "8")]))
            .await?;
        assert!(tx.is_open());
        assert!(!cache.ctx.locks.is_empty());
    }
    assert!(cache.ctx.locks.is_empty());

    let mut tx = cache.ctx.transaction("//example.org/closed");
    tx.init_cache().await?;
    tx.close();
    tx.close();
    assert_eq!(tx.phase(), Phase::Closed);
    assert!(tx.cache().is_none());
    assert!(tx.descriptor().is_none());
    Ok(())
}

#[tokio::test]
async fn init_and_open_serves_only_complete_objects() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("//example.org/page");
    let err = tx.init_and_open().await.unwrap_err();
    assert!(matches!(err, TransactionError::NothingToServe { .. }));
    tx.close();

    let response = headers(&[("content-length", "4"), ("content-type", "text/html")]);
    store_object(&cache, "//example.org/page", &response, b"<p/>").await?;

    let mut tx = cache.ctx.transaction("//example.org/page");
    tx.init_and_open().await?;
    assert!(tx.served_from_cache());
    let mut downstream = HeaderMap::new();
    tx.prepare_response(&mut downstream)?;
    assert_eq!(header(&downstream, "content-type"), Some("text/html"));
    let mut buf = [0u8; 8];
    let read = tx.read(&mut buf).await?;
    assert_eq!(&buf[..read], b"<p/>");
    Ok(())
}

#[tokio::test]
async fn missing_media_type_defaults_on_commit() -> Result<()> {
    let cache = TestCache::new()?;
    store_object(
        &cache,
        "//example.org/blob",
        &headers(&[("content-length", "2")]),
        b"ok",
    )
    .await?;
    let descriptor = cache
        .ctx
        .store
        .fetch(&Descriptor::by_path("example.org/blob"))?;
    assert_eq!(
        descriptor.mediatype.as_deref(),
        Some("application/octet-stream")
    );
    Ok(())
}

#[tokio::test]
async fn unknown_content_type_parameter_fails_the_transaction() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("//example.org/odd");
    tx.init_cache().await?;
    tx.init_data()?;
    tx.prepare_request(&mut HeaderMap::new())?;
    let response = headers(&[("content-type", "text/plain; format=flowed")]);
    let err = tx
        .finish_request(StatusCode::OK, &response)
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::Map(_)));
    tx.close();
    assert!(cache.ctx.store.descriptors()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn closing_emits_a_cache_log_event() -> Result<()> {
    let recorder = CacheLogRecorder::install();
    let cache = TestCache::new()?;
    store_object(
        &cache,
        "//example.org/logged",
        &headers(&[("content-length", "2")]),
        b"ok",
    )
    .await?;
    let mut failed = cache.ctx.transaction("http://example.org/logged");
    assert!(failed.init_cache().await.is_err());
    drop(failed);

    let stored = recorder
        .event_for("//example.org/logged")
        .expect("cache log event for stored transaction");
    assert_eq!(stored["outcome"], "stored");
    assert_eq!(stored["durable"], true);
    assert_eq!(stored["key"], "example.org/logged");
    assert_eq!(stored["state"], "new");
    assert_eq!(stored["conditional"], "none");
    assert!(stored.get("error_reason").is_none());

    let failed = recorder
        .event_for("http://example.org/logged")
        .expect("cache log event for failed transaction");
    assert_eq!(failed["outcome"], "failed");
    assert_eq!(failed["durable"], false);
    assert_eq!(failed["phase"], "init");
    assert_eq!(failed["error_reason"], "malformed_url");
    assert_eq!(recorder.events().len(), 2);
    Ok(())
}

#[tokio::test]
async fn interleaved_first_fetches_share_one_descriptor() -> Result<()> {
    let cache = TestCache::new()?;
    let url = "//example.org/race";
    let response = headers(&[("content-length", "2"), ("content-type", "text/plain")]);

    let mut first = cache.ctx.transaction(url);
    first.init_cache().await?;
    first.init_data()?;
    let mut second = cache.ctx.transaction(url);
    second.init_cache().await?;
    second.init_data()?;
    assert!(!first.descriptor().unwrap().is_stored());
    assert!(!second.descriptor().unwrap().is_stored());

    for tx in [&mut first, &mut second] {
        tx.prepare_request(&mut HeaderMap::new())?;
        tx.finish_request(StatusCode::OK, &response).await?;
        tx.prepare_response(&mut HeaderMap::new())?;
        tx.append(b"ok").await?;
        assert_eq!(tx.finish_body().await?, CacheState::Full);
        tx.close();
    }

    let rows = cache.ctx.store.filter(&Descriptor::by_path("example.org/race"))?;
    assert_eq!(rows.len(), 1);

    let mut third = cache.ctx.transaction(url);
    third.init_cache().await?;
    third.init_data()?;
    assert_eq!(third.descriptor().unwrap().id(), rows[0].id());
    Ok(())
}

#[tokio::test]
async fn body_of_unknown_length_records_its_final_size() -> Result<()> {
    let cache = TestCache::new()?;
    let mut tx = cache.ctx.transaction("//example.org/chunked");
    tx.init_cache().await?;
    tx.init_data()?;
    tx.prepare_request(&mut HeaderMap::new())?;
    tx.finish_request(StatusCode::OK, &headers(&[("content-type", "text/plain")]))
        .await?;
    let mut downstream = HeaderMap::new();
    tx.prepare_response(&mut downstream)?;
    assert!(downstream.get("content-length").is_none());
    tx.append(b"hello").await?;
    assert_eq!(tx.finish_body().await?, CacheState::Full);
    assert_eq!(tx.descriptor().unwrap().size, Some(5));
    tx.close();

    let descriptor = cache
        .ctx
        .store
        .fetch(&Descriptor::by_path("example.org/chunked"))?;
    assert_eq!(descriptor.size, Some(5));
    Ok(())
}

#[tokio::test]
async fn partial_object_without_modification_time_is_refetched() -> Result<()> {
    let cache = TestCache::new()?;
    let first = headers(&[
        ("content-length", "10"),
        ("etag", "\"v1\""),
        ("last-modified", LAST_MODIFIED),
    ]);
    store_object(&cache, "//example.org/big.bin", &first, b"01234").await?;

    let mut tx = cache.ctx.transaction("//example.org/big.bin");
    tx.init_cache().await?;
    tx.init_data()?;
    assert!(tx.cache().unwrap().partial());
    tx.cache_mut().unwrap().set_mtime(None);
    let mut request = HeaderMap::new();
    tx.prepare_request(&mut request)?;
    assert!(request.get("range").is_none());
    assert!(request.get("if-range").is_none());
    assert_eq!(header(&request, "if-none-match"), Some("\"v1\""));
    assert_eq!(tx.conditional(), Conditional::Revalidate);
    Ok(())
}
