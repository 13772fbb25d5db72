//! 日志门面
//!
//! 统一通过 rat_logger 输出，crate 内部一律从这里导入日志宏

pub use rat_logger::{debug, error, info, trace, warn};
