//! 宿主机一侧的工具：把镜像文件当作块设备挂载 extent-fs。


mod block_file;

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use extent_fs::{Config, Volume};
use typed_bytesize::ByteSizeIec;

pub use self::block_file::BlockFile;

/// 秒级的系统时间，早于纪元时为 0
pub fn system_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// 使用系统时间的默认挂载参数
pub fn host_config() -> Config {
    Config {
        clock: system_clock,
        ..Config::default()
    }
}

/// 打开镜像文件，不存在时按 `size` 创建
pub fn open_image(path: &Path, size: ByteSizeIec) -> io::Result<Arc<BlockFile>> {
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if fd.metadata()?.len() == 0 {
        fd.set_len(size.0)?;
        log::info!("created image {path:?} of {} bytes", size.0);
    }
    BlockFile::new(fd).map(Arc::new)
}

/// 挂载镜像上的卷，没有卷时格式化
pub fn mount_image(path: &Path, size: ByteSizeIec, config: Config) -> io::Result<Volume> {
    let device = open_image(path, size)?;
    Volume::mount(device, config).map_err(|err| io::Error::other(err.to_string()))
}
