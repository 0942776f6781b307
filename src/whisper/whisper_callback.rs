use std::ffi::c_void;
use std::sync::{atomic::AtomicBool, mpsc::SyncSender};

use whisper_rs::FullParams;
use whisper_rs::whisper_rs_sys;

use crate::{
    service::engine::{EngineError, Segment},
    vad::energy_vad::SpeechTimeline,
};

/// Data the new-segment callback needs while whisper.cpp runs.
pub struct SegmentSink {
    pub out: SyncSender<Result<Segment, EngineError>>,
    pub timeline: SpeechTimeline,
    pub word_timestamps: bool,
    /// Set once the receiver is gone; later segments are dropped unread.
    pub closed: AtomicBool,
}

/// Safe wrapper around Whisper C API callback data
pub struct WhisperCallback {
    ptr: *mut c_void,
}

impl WhisperCallback {
    /// Create a new callback and convert it to a raw pointer for C API
    pub fn new(sink: SegmentSink) -> Self {
        Self {
            ptr: Box::into_raw(Box::new(sink)) as *mut c_void,
        }
    }

    /// Set up callback function in FullParams
    ///
    /// `self` must outlive the `full()` call that uses `fp`.
    pub fn setup_callback(
        &self,
        fp: &mut FullParams,
        callback: unsafe extern "C" fn(
            *mut whisper_rs_sys::whisper_context,
            *mut whisper_rs_sys::whisper_state,
            i32,
            *mut c_void,
        ),
    ) {
        // Safety: The pointer is valid and owned by this struct
        unsafe {
            fp.set_new_segment_callback(Some(callback));
            fp.set_new_segment_callback_user_data(self.ptr);
        }
    }
}

impl Drop for WhisperCallback {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // Safety: reclaiming the Box created in `new`; whisper.cpp is done with it.
            unsafe {
                drop(Box::from_raw(self.ptr as *mut SegmentSink));
            }
            self.ptr = std::ptr::null_mut();
        }
    }
}
