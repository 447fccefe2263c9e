use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use block_dev::{BLOCK_SIZE, BlockDevice};

/// 以宿主机上的镜像文件充当块设备
#[derive(Debug)]
pub struct BlockFile {
    file: Mutex<File>,
    blocks: usize,
}

impl BlockFile {
    /// 镜像长度不足一块的尾部不计入
    pub fn new(file: File) -> io::Result<Self> {
        let blocks = file.metadata()?.len() as usize / BLOCK_SIZE;
        Ok(Self {
            file: Mutex::new(file),
            blocks,
        })
    }

    fn transfer(
        &self,
        block_id: usize,
        len: usize,
        mut op: impl FnMut(&mut File, usize) -> io::Result<()>,
    ) -> usize {
        let Ok(mut file) = self.file.lock() else {
            log::error!("image file lock poisoned");
            return 0;
        };
        if let Err(err) = file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64)) {
            log::error!("seeking to block {block_id}: {err}");
            return 0;
        }

        let wanted = (len / BLOCK_SIZE).min(self.blocks.saturating_sub(block_id));
        for i in 0..wanted {
            if let Err(err) = op(&mut *file, i) {
                log::error!("block {}: {err}", block_id + i);
                return i;
            }
        }
        wanted
    }
}

impl BlockDevice for BlockFile {
    fn read_blocks(&self, block_id: usize, buf: &mut [u8]) -> usize {
        let len = buf.len();
        self.transfer(block_id, len, |file, i| {
            file.read_exact(&mut buf[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE])
        })
    }

    fn write_blocks(&self, block_id: usize, buf: &[u8]) -> usize {
        self.transfer(block_id, buf.len(), |file, i| {
            file.write_all(&buf[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE])
        })
    }

    fn num_blocks(&self) -> usize {
        self.blocks
    }
}
