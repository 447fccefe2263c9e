#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use extent_fs::{BLOCK_SIZE, BlockDevice, Config, Volume};

/// 内存中的块设备，可以让某个块号及之后的读写失败
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    fail_reads_from: AtomicUsize,
    fail_writes_from: AtomicUsize,
}

impl RamDisk {
    pub fn new(blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; blocks * BLOCK_SIZE]),
            fail_reads_from: AtomicUsize::new(usize::MAX),
            fail_writes_from: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn fail_reads_from(&self, block_id: usize) {
        self.fail_reads_from.store(block_id, Ordering::SeqCst);
    }

    pub fn fail_writes_from(&self, block_id: usize) {
        self.fail_writes_from.store(block_id, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_reads_from(usize::MAX);
        self.fail_writes_from(usize::MAX);
    }
}

impl BlockDevice for RamDisk {
    fn read_blocks(&self, block_id: usize, buf: &mut [u8]) -> usize {
        let data = self.data.lock().unwrap();
        let limit = self.fail_reads_from.load(Ordering::SeqCst);
        let mut done = 0;
        for (i, chunk) in buf.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            let id = block_id + i;
            if id >= limit || (id + 1) * BLOCK_SIZE > data.len() {
                break;
            }
            chunk.copy_from_slice(&data[id * BLOCK_SIZE..(id + 1) * BLOCK_SIZE]);
            done += 1;
        }
        done
    }

    fn write_blocks(&self, block_id: usize, buf: &[u8]) -> usize {
        let mut data = self.data.lock().unwrap();
        let limit = self.fail_writes_from.load(Ordering::SeqCst);
        let mut done = 0;
        for (i, chunk) in buf.chunks_exact(BLOCK_SIZE).enumerate() {
            let id = block_id + i;
            if id >= limit || (id + 1) * BLOCK_SIZE > data.len() {
                break;
            }
            data[id * BLOCK_SIZE..(id + 1) * BLOCK_SIZE].copy_from_slice(chunk);
            done += 1;
        }
        done
    }

    fn num_blocks(&self) -> usize {
        self.data.lock().unwrap().len() / BLOCK_SIZE
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn mount(blocks: usize, config: Config) -> (Arc<RamDisk>, Volume) {
    init_logger();
    let disk = RamDisk::new(blocks);
    let volume = Volume::mount(disk.clone(), config).unwrap();
    (disk, volume)
}

/// 可辨认的测试数据
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32 * 7 + seed as u32) as u8 ^ (i / 251) as u8)
        .collect()
}
