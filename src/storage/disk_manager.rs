use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{BurrowDBError, BurrowDBResult};

static EMPTY_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

/// Page-granular I/O over a single database file. Page ids are assigned
/// monotonically; deallocated ids are kept in memory and handed out again
/// before the high-water mark grows.
#[derive(Debug)]
pub struct DiskManager {
    next_page_id: AtomicU32,
    db_file: Mutex<File>,
    free_page_ids: Mutex<Vec<PageId>>,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> BurrowDBResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;

        // Page 0 is INVALID_PAGE_ID; the first real page sits at offset
        // PAGE_SIZE.
        let file_len = db_file.metadata()?.len();
        let pages_on_disk = (file_len as usize).div_ceil(PAGE_SIZE) as PageId;
        let next_page_id = pages_on_disk.max(1);
        debug!(
            "disk manager opened {:?}, next_page_id={}",
            db_path.as_ref(),
            next_page_id
        );

        Ok(Self {
            next_page_id: AtomicU32::new(next_page_id),
            db_file: Mutex::new(db_file),
            free_page_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn allocate_page(&self) -> BurrowDBResult<PageId> {
        if let Some(page_id) = self.free_page_ids.lock().pop() {
            return Ok(page_id);
        }
        Ok(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn deallocate_page(&self, page_id: PageId) -> BurrowDBResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(BurrowDBError::Storage(
                "cannot deallocate the invalid page".to_string(),
            ));
        }
        // Zero the on-disk image so a re-read of a recycled id starts clean.
        self.write_page(page_id, &EMPTY_PAGE)?;
        self.free_page_ids.lock().push(page_id);
        Ok(())
    }

    pub fn read_page(&self, page_id: PageId) -> BurrowDBResult<[u8; PAGE_SIZE]> {
        if page_id == INVALID_PAGE_ID {
            return Err(BurrowDBError::Storage(
                "cannot read the invalid page".to_string(),
            ));
        }
        let mut buf = [0u8; PAGE_SIZE];
        let mut file = self.db_file.lock();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        if offset >= file.metadata()?.len() {
            // Freshly allocated page that was never written; reads as zeroes.
            return Ok(buf);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut read_total = 0;
        while read_total < PAGE_SIZE {
            let n = file.read(&mut buf[read_total..])?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> BurrowDBResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(BurrowDBError::Storage(
                "cannot write the invalid page".to_string(),
            ));
        }
        if data.len() != PAGE_SIZE {
            return Err(BurrowDBError::Storage(format!(
                "page write of {} bytes, expected {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn sync(&self) -> BurrowDBResult<()> {
        self.db_file.lock().sync_data()?;
        Ok(())
    }
}
