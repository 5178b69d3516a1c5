// MangaShelf - Offline Manga Reader Core
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! C FFI bridge for the mobile host application
//!
//! The host (Swift on iOS, Kotlin through a thin JNI shim on Android) talks to
//! the engine through the C functions below. One [`Engine`] lives per process:
//! `rust_engine_init` builds and starts it, every other function uses it.
//!
//! # Design Patterns
//! 1. **JSON Communication**: arguments that are not plain strings, and every
//!    result, cross the boundary as JSON
//! 2. **Error Handling**: errors come back as JSON error responses
//! 3. **Async Runtime**: a process-wide Tokio runtime drives the engine
//! 4. **No Panics**: panics are caught before they reach the host
//! 5. **Memory Safety**: returned strings must be freed with `rust_free_string()`
//!
//! # Response Format
//! ```json
//! { "success": true, "data": { ... } }
//! ```
//! Or on error:
//! ```json
//! { "success": false, "error": "Error message" }
//! ```
//!
//! Example Swift code:
//! ```swift
//! let resultPtr = rust_get_storage_stats()
//! defer { rust_free_string(resultPtr) }
//! let jsonString = String(cString: resultPtr)
//! ```

use crate::config::EngineConfig;
use crate::content::{ManualCleanupOptions, PageRequest};
use crate::download::{BatchOptions, ChapterInfo};
use crate::engine::Engine;
use crate::error::{Result, ShelfError};
use crate::image_cache::CacheContext;
use crate::settings::DownloadSettingsUpdate;
use serde::Serialize;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic;
use std::sync::{Arc, RwLock};

lazy_static::lazy_static! {
    static ref RUNTIME: tokio::runtime::Runtime =
        tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    static ref ENGINE: RwLock<Option<Arc<Engine>>> = RwLock::new(None);
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Safely convert C string pointer to Rust String
fn c_str_to_string(ptr: *const c_char) -> Result<String> {
    if ptr.is_null() {
        return Err(ShelfError::InvalidInput("Null pointer received".to_string()));
    }
    // SAFETY: the host passes valid null-terminated strings
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| ShelfError::InvalidInput(format!("Invalid UTF-8: {}", e)))
    }
}

/// Null means "not given"
fn optional_c_str(ptr: *const c_char) -> Result<Option<String>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        c_str_to_string(ptr).map(Some)
    }
}

fn json_arg<T: serde::de::DeserializeOwned>(ptr: *const c_char, what: &str) -> Result<T> {
    let json = c_str_to_string(ptr)?;
    serde_json::from_str(&json).map_err(|e| ShelfError::InvalidInput(format!("Invalid {} JSON: {}", what, e)))
}

/// Caller MUST free the returned pointer using `rust_free_string()`
fn string_to_c_str(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(c_string) => c_string.into_raw(),
        Err(_) => {
            let error_json = error_response("String contains null bytes");
            CString::new(error_json).unwrap_or_default().into_raw()
        }
    }
}

fn success_response<T: Serialize>(data: T) -> String {
    serde_json::json!({
        "success": true,
        "data": data
    })
    .to_string()
}

fn error_response(error: &str) -> String {
    serde_json::json!({
        "success": false,
        "error": error
    })
    .to_string()
}

/// Wrap a function call with panic catching
fn catch_panic<F>(f: F) -> String
where
    F: FnOnce() -> Result<String> + panic::UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => error_response(&e.to_string()),
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Unknown panic occurred".to_string()
            };
            error_response(&format!("Rust panic: {}", panic_msg))
        }
    }
}

fn engine() -> Result<Arc<Engine>> {
    ENGINE
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .clone()
        .ok_or_else(|| ShelfError::InvalidState("Engine not initialized; call rust_engine_init first".to_string()))
}

/// Run `f` against the engine on the bridge runtime and wrap its result
fn with_engine<T, F, Fut>(f: F) -> *mut c_char
where
    T: Serialize,
    F: FnOnce(Arc<Engine>) -> Fut + panic::UnwindSafe,
    Fut: std::future::Future<Output = Result<T>>,
{
    let response = catch_panic(|| {
        let engine = engine()?;
        let data = RUNTIME.block_on(f(engine))?;
        Ok(success_response(data))
    });
    string_to_c_str(response)
}

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Build and start the engine
///
/// # Arguments
/// * `config_json` - serialized `EngineConfig`; missing fields use defaults
///
/// # Returns
/// `{"success": true, "data": {"initialized": true}}`. Calling it again while
/// an engine is running returns the same without rebuilding.
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_engine_init(config_json: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let config: EngineConfig = json_arg(config_json, "config")?;

        if engine().is_ok() {
            return Ok(success_response(serde_json::json!({ "initialized": true })));
        }

        let engine = RUNTIME.block_on(async {
            let engine = Engine::builder(config).build().await?;
            engine.start().await?;
            Ok::<_, ShelfError>(Arc::new(engine))
        })?;
        *ENGINE.write().unwrap_or_else(|p| p.into_inner()) = Some(engine);

        Ok(success_response(serde_json::json!({ "initialized": true })))
    });

    string_to_c_str(response)
}

/// Stop background work, flush bookkeeping and drop the engine
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_engine_shutdown() -> *mut c_char {
    let response = catch_panic(|| {
        let engine = ENGINE.write().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(engine) = engine {
            RUNTIME.block_on(engine.shutdown());
        }
        Ok(success_response(serde_json::json!({ "shutdown": true })))
    });

    string_to_c_str(response)
}

// ============================================================================
// DOWNLOADS
// ============================================================================

/// Hand over the page list of a chapter before it is queued
///
/// # Arguments
/// * `pages_json` - `[{"page_number": 1, "original_url": "https://..."}, ...]`
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_register_chapter_pages(
    manga_id: *const c_char,
    chapter_number: *const c_char,
    pages_json: *const c_char,
) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let chapter_number = c_str_to_string(chapter_number)?;
        let pages: Vec<PageRequest> = json_arg(pages_json, "pages")?;
        let count = pages.len();
        engine.registered_pages().register(&manga_id, &chapter_number, pages).await;
        Ok(serde_json::json!({ "registered_pages": count }))
    })
}

/// Queue one chapter; `data.queued` is false when it was already queued
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_enqueue_chapter(
    manga_id: *const c_char,
    chapter_number: *const c_char,
    chapter_url: *const c_char,
) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let chapter_number = c_str_to_string(chapter_number)?;
        let chapter_url = c_str_to_string(chapter_url)?;
        let queued = engine.queue().add_to_queue(&manga_id, &chapter_number, &chapter_url).await?;
        engine.status().invalidate(&manga_id, &chapter_number);
        Ok(serde_json::json!({ "queued": queued }))
    })
}

/// Register or refresh a manga's chapters for batch downloads
///
/// # Arguments
/// * `chapters_json` - `[{"chapter_number": "1", "chapter_url": "https://..."}, ...]`
/// * `options_json` - `{"cover_url": "..."}`, may be null
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_update_batch_session(
    manga_id: *const c_char,
    title: *const c_char,
    chapters_json: *const c_char,
    options_json: *const c_char,
) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let title = c_str_to_string(title)?;
        let chapters: Vec<ChapterInfo> = json_arg(chapters_json, "chapters")?;
        let options: BatchOptions = match optional_c_str(options_json)? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| ShelfError::InvalidInput(format!("Invalid options JSON: {}", e)))?,
            None => BatchOptions::default(),
        };
        engine
            .batch()
            .update_session_metadata(&manga_id, &title, chapters, options)
            .await;
        Ok(engine.batch().get_state(&manga_id).await)
    })
}

/// Start a batch download
///
/// # Arguments
/// * `selected_json` - array of chapter numbers, or null for every registered chapter
///
/// # Returns
/// The resulting `BatchDownloadState`
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_start_batch_download(manga_id: *const c_char, selected_json: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let selected: Option<Vec<String>> = match optional_c_str(selected_json)? {
            Some(json) => Some(
                serde_json::from_str(&json)
                    .map_err(|e| ShelfError::InvalidInput(format!("Invalid selection JSON: {}", e)))?,
            ),
            None => None,
        };
        engine.batch().start_batch_download(&manga_id, selected).await
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_cancel_batch_download(manga_id: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let removed = engine.batch().cancel_batch_download(&manga_id).await?;
        engine.status().invalidate_manga(&manga_id);
        Ok(serde_json::json!({ "removed_from_queue": removed }))
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_retry_failed_chapters(manga_id: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let queued = engine.batch().retry_failed_chapters(&manga_id).await?;
        engine.status().invalidate_manga(&manga_id);
        Ok(serde_json::json!({ "queued": queued }))
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_batch_state(manga_id: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        Ok(engine.batch().get_state(&manga_id).await)
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_chapter_status(manga_id: *const c_char, chapter_number: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let chapter_number = c_str_to_string(chapter_number)?;
        Ok(engine.status().get_chapter_download_status(&manga_id, &chapter_number).await)
    })
}

/// Statuses plus a summary for several chapters
///
/// # Arguments
/// * `chapters_json` - array of chapter numbers
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_batch_status(manga_id: *const c_char, chapters_json: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let chapters: Vec<String> = json_arg(chapters_json, "chapters")?;
        Ok(engine.status().get_batch_download_status(&manga_id, &chapters).await)
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_pause_downloads() -> *mut c_char {
    with_engine(|engine| async move {
        engine.manager().pause();
        engine.status().clear_cache();
        Ok(serde_json::json!({ "paused": true }))
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_resume_downloads() -> *mut c_char {
    with_engine(|engine| async move {
        engine.manager().resume();
        engine.status().clear_cache();
        Ok(serde_json::json!({ "paused": false }))
    })
}

// ============================================================================
// DOWNLOADED CONTENT
// ============================================================================

/// Page files of a downloaded chapter, or `data: null` when it is not on disk
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_chapter_images(manga_id: *const c_char, chapter_number: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let chapter_number = c_str_to_string(chapter_number)?;
        engine.store().get_chapter_images(&manga_id, &chapter_number).await
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_delete_chapter(manga_id: *const c_char, chapter_number: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let chapter_number = c_str_to_string(chapter_number)?;
        let deleted = engine.store().delete_chapter(&manga_id, &chapter_number).await?;
        Ok(serde_json::json!({ "deleted": deleted }))
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_downloaded_chapters(manga_id: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        engine.store().get_downloaded_chapters(&manga_id).await
    })
}

/// `DetailedStorageStats` for the settings screen
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_storage_stats() -> *mut c_char {
    with_engine(|engine| async move { engine.store().get_detailed_storage_stats().await })
}

/// # Arguments
/// * `options_json` - `{"older_than_days": 30, "manga_id": "...", "target_size": 1073741824}`
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_perform_manual_cleanup(options_json: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let options: ManualCleanupOptions = json_arg(options_json, "cleanup options")?;
        let report = engine.store().perform_manual_cleanup(options).await?;
        engine.status().clear_cache();
        Ok(report)
    })
}

// ============================================================================
// SETTINGS
// ============================================================================

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_download_settings() -> *mut c_char {
    with_engine(|engine| async move { Ok(engine.settings().get().await) })
}

/// Partial update; omitted fields keep their value
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_update_download_settings(update_json: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let update: DownloadSettingsUpdate = json_arg(update_json, "settings")?;
        engine.update_settings(update).await
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_reset_download_settings() -> *mut c_char {
    with_engine(|engine| async move { engine.reset_settings().await })
}

// ============================================================================
// IMAGE CACHE
// ============================================================================

/// Local path for an image, or the URL itself when it could not be cached
///
/// # Arguments
/// * `context` - "manga", "search", "bookmark" or "download"
/// * `manga_id` - may be null
///
/// # Returns
/// `{"success": true, "data": {"path": "..."}}`
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_cached_image_path(
    url: *const c_char,
    context: *const c_char,
    manga_id: *const c_char,
) -> *mut c_char {
    with_engine(move |engine| async move {
        let url = c_str_to_string(url)?;
        let context: CacheContext = c_str_to_string(context)?.parse().map_err(ShelfError::InvalidInput)?;
        let manga_id = optional_c_str(manga_id)?;
        let path = engine
            .image_cache()
            .get_cached_image_path(&url, context, manga_id.as_deref())
            .await;
        Ok(serde_json::json!({ "path": path }))
    })
}

/// Refresh a manga's banner when its URL changed
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_validate_manga_image(manga_id: *const c_char, current_url: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let manga_id = c_str_to_string(manga_id)?;
        let current_url = c_str_to_string(current_url)?;
        let path = engine
            .image_cache()
            .validate_and_update_cache(&manga_id, &current_url)
            .await;
        Ok(serde_json::json!({ "path": path }))
    })
}

/// Clear cached images
///
/// # Arguments
/// * `scope` - "search", "all", or a manga id
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_clear_image_cache(scope: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let scope = c_str_to_string(scope)?;
        let cache = engine.image_cache();
        let removed = match scope.as_str() {
            "search" => Some(cache.clear_search_cache().await?),
            "all" => {
                cache.clear_all().await?;
                None
            }
            manga_id => Some(cache.clear_manga_cache(manga_id).await?),
        };
        Ok(serde_json::json!({ "removed": removed }))
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_image_cache_stats() -> *mut c_char {
    with_engine(|engine| async move { engine.image_cache().get_cache_stats().await })
}

// ============================================================================
// SEARCH RESULTS
// ============================================================================

/// Cached results of a recent search, `data: null` on a miss
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_cached_search(query: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let query = c_str_to_string(query)?;
        Ok(engine.search_cache().get(&query).await)
    })
}

/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_cache_search(query: *const c_char, results_json: *const c_char) -> *mut c_char {
    with_engine(move |engine| async move {
        let query = c_str_to_string(query)?;
        let results: serde_json::Value = json_arg(results_json, "search results")?;
        engine.search_cache().put(&query, results).await;
        Ok(serde_json::json!({ "cached": true }))
    })
}

// ============================================================================
// MEMORY
// ============================================================================

/// Free a string returned by any function in this module
///
/// # Safety
/// Must be called exactly once per returned string.
#[no_mangle]
pub extern "C" fn rust_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        // SAFETY: ptr came from CString::into_raw in this module
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn take(ptr: *mut c_char) -> serde_json::Value {
        let json = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        rust_free_string(ptr);
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_success_and_error_responses() {
        let ok: serde_json::Value = serde_json::from_str(&success_response(serde_json::json!({"a": 1}))).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"]["a"], 1);

        let err: serde_json::Value = serde_json::from_str(&error_response("Test error")).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"], "Test error");
    }

    #[test]
    fn test_catch_panic_with_panic() {
        let result = catch_panic(|| -> Result<String> {
            panic!("test panic");
        });
        assert!(result.contains("\"success\":false"));
        assert!(result.contains("test panic"));
    }

    #[test]
    fn test_null_pointer_handling() {
        assert!(c_str_to_string(std::ptr::null()).is_err());
        assert_eq!(optional_c_str(std::ptr::null()).unwrap(), None);
    }

    #[test]
    fn test_engine_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let config = serde_json::json!({
            "cache_root": temp_dir.path(),
            "downloads_root": temp_dir.path().join("downloads"),
        })
        .to_string();
        let config = CString::new(config).unwrap();

        let init = take(rust_engine_init(config.as_ptr()));
        assert_eq!(init["success"], true, "{}", init);

        let update = CString::new(r#"{"max_concurrent_downloads": 2}"#).unwrap();
        let settings = take(rust_update_download_settings(update.as_ptr()));
        assert_eq!(settings["data"]["max_concurrent_downloads"], 2);

        let manga = CString::new("m1").unwrap();
        let chapter = CString::new("1").unwrap();
        let status = take(rust_get_chapter_status(manga.as_ptr(), chapter.as_ptr()));
        assert_eq!(status["data"]["status"], "queued");

        let images = take(rust_get_chapter_images(manga.as_ptr(), chapter.as_ptr()));
        assert_eq!(images["success"], true);
        assert!(images["data"].is_null());

        let bad_context = CString::new("cover").unwrap();
        let url = CString::new("https://cdn/a.jpg").unwrap();
        let cached = take(rust_get_cached_image_path(url.as_ptr(), bad_context.as_ptr(), std::ptr::null()));
        assert_eq!(cached["success"], false);

        let shutdown = take(rust_engine_shutdown());
        assert_eq!(shutdown["success"], true);

        let after = take(rust_get_download_settings());
        assert_eq!(after["success"], false);
    }
}
