//! Shared fixtures: session files on disk and on a fake device.

#![allow(dead_code)]

pub mod mock_adb;

use std::fs;
use std::path::Path;

use minitrace::device::MemoryDevice;
use minitrace::trace::SegmentBuilder;

pub const PREFIX: &str = "/data/local/tmp/mt_0_";
pub const BASE: &str = "mt_0_";

pub const MAIN_TID: u16 = 7;
pub const WORKER_TID: u16 = 8;
pub const DISPATCH: u32 = 0x100;
pub const ON_CLICK: u32 = 0x1000;
pub const ON_DRAW: u32 = 0x1008;
pub const WORKER_RUN: u32 = 0x2000;

pub fn threads_file() -> &'static str {
    "7\tmain\n8\tAsyncTask #1\n"
}

pub fn methods_file() -> &'static str {
    "100\tLandroid/os/Handler;\tdispatchMessage\t(Landroid/os/Message;)V\tHandler.java\n\
     1000\tLcom/example/MainActivity;\tonClick\t(Landroid/view/View;)V\tMainActivity.java\n\
     1008\tLcom/example/CanvasView;\tonDraw\t(Landroid/graphics/Canvas;)V\tCanvasView.java\n\
     2000\tLcom/example/Loader;\trun\t()V\tLoader.java\n"
}

pub fn fields_file() -> &'static str {
    "3000\t0\tLcom/example/Loader;\tcount\tI\n"
}

/// Two dispatched messages in the first idle window, one in the second,
/// a worker thread running alongside.
pub fn first_segment() -> SegmentBuilder {
    SegmentBuilder::new()
        .start_ms(1_700_000_000_000)
        .method_enter(MAIN_TID, DISPATCH)
        .message(MAIN_TID, "[id 1] 0x1 { callback=@@ target=@@ } /r click")
        .method_enter(MAIN_TID, ON_CLICK)
        .method_exit(MAIN_TID, ON_CLICK)
        .method_exit(MAIN_TID, DISPATCH)
        .method_enter(WORKER_TID, WORKER_RUN)
        .field_write(WORKER_TID, 0x3000, 0xBEEF, 0x12, 0)
        .method_enter(MAIN_TID, DISPATCH)
        .message(MAIN_TID, "[id 2] 0x2 { callback=@@ target=@@ } /r draw")
        .method_enter(MAIN_TID, ON_DRAW)
        .method_enter(MAIN_TID, ON_DRAW)
        .method_exit(MAIN_TID, DISPATCH)
        .idle(1_700_000_000_100)
}

pub fn second_segment() -> SegmentBuilder {
    SegmentBuilder::new()
        .start_ms(1_700_000_000_200)
        .method_enter(MAIN_TID, DISPATCH)
        .message(MAIN_TID, "[id 3] 0x3 { callback=@@ target=@@ } /r click")
        .method_enter(MAIN_TID, ON_CLICK)
        .method_exit(MAIN_TID, DISPATCH)
        .idle(1_700_000_000_300)
}

/// Write a complete `mt_0_` session into `dir`.
pub fn write_session(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("{BASE}info_t.log")), threads_file()).unwrap();
    fs::write(dir.join(format!("{BASE}info_m.log")), methods_file()).unwrap();
    fs::write(dir.join(format!("{BASE}info_f.log")), fields_file()).unwrap();
    fs::write(dir.join(format!("{BASE}data_0.bin")), first_segment().finish()).unwrap();
    fs::write(dir.join(format!("{BASE}data_1.bin")), second_segment().finish()).unwrap();
}

/// The same session, left on a fake device under [`PREFIX`].
pub fn add_session(device: &MemoryDevice) {
    device.add_file(&format!("{PREFIX}info_t.log"), threads_file());
    device.add_file(&format!("{PREFIX}info_m.log"), methods_file());
    device.add_file(&format!("{PREFIX}info_f.log"), fields_file());
    device.add_file(&format!("{PREFIX}data_0.bin"), first_segment().finish());
    device.add_file(&format!("{PREFIX}data_1.bin"), second_segment().finish());
}
