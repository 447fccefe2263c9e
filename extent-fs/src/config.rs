use alloc::string::String;

/// 挂载参数
#[derive(Debug, Clone)]
pub struct Config {
    /// 格式化时写入卷控制块的卷名，超出 31 字节的部分被截断
    pub volume_name: String,
    /// 新建目录的目录项个数
    pub directory_entries: usize,
    /// 主空闲区段表按总块数的百分比预留空间
    pub free_space_percent: usize,
    /// 空文件第一次写入时申请的块数，此后每次扩容翻倍
    pub initial_grant: u32,
    /// 同时打开的文件数上限
    pub max_open_files: usize,
    /// 时间戳来源，单位为秒
    pub clock: fn() -> i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            volume_name: String::from("EXTENT-FS"),
            directory_entries: 50,
            free_space_percent: 5,
            initial_grant: 100,
            max_open_files: 20,
            clock: || 0,
        }
    }
}
