//! 日志初始化（fern + log）

use log::LevelFilter;
use std::path::Path;
use std::str::FromStr;

/// 初始化全局日志：输出到 stderr（stdout 留给命令结果），可选追加写入日志文件
///
/// 全局 logger 只能设置一次，重复调用返回错误，调用方可以忽略。
pub fn init_logging(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // 依赖库的连接日志过于啰嗦
        .level_for("hyper", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .chain(std::io::stderr());

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}
