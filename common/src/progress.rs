use tracing::instrument;

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex.lock().unwrap();
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| x + *y.lock().unwrap())
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy pipeline counters, updated from the producer and every writer task.
pub struct Progress {
    pub rows_read: TlsCounter,
    pub batches_built: TlsCounter,
    pub batches_written: TlsCounter,
    pub batches_failed: TlsCounter,
    pub rows_written: TlsCounter,
    pub bytes_written: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            rows_read: Default::default(),
            batches_built: Default::default(),
            batches_written: Default::default(),
            batches_failed: Default::default(),
            rows_written: Default::default(),
            bytes_written: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_rows: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_rows: progress.rows_written.get(),
            last_bytes: progress.bytes_written.get(),
            last_update: std::time::Instant::now(),
        }
    }

    #[instrument(skip(self))]
    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let rows = self.progress.rows_written.get();
        let avarage_rows_rate = rows as f64 / total_duration_secs;
        let current_rows_rate = (rows - self.last_rows) as f64 / curr_duration_secs;
        let bytes = self.progress.bytes_written.get();
        let avarage_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = (bytes - self.last_bytes) as f64 / curr_duration_secs;
        let pending = self
            .progress
            .batches_built
            .get()
            .saturating_sub(self.progress.batches_written.get() + self.progress.batches_failed.get());
        // update self
        self.last_rows = rows;
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            ROWS:\n\
            read:    {:>10}\n\
            written: {:>10}\n\
            average: {:>10.2} rows/s\n\
            current: {:>10.2} rows/s\n\
            -----------------------\n\
            BATCHES:\n\
            pending: {:>10}\n\
            written: {:>10}\n\
            failed:  {:>10}\n\
            -----------------------\n\
            WRITTEN:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}",
            self.progress.rows_read.get(),
            rows,
            avarage_rows_rate,
            current_rows_rate,
            pending,
            self.progress.batches_written.get(),
            self.progress.batches_failed.get(),
            bytesize::ByteSize(avarage_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_counting() {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
    }

    #[test]
    fn threaded_counting() {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..10 {
                handles.push(scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                }));
            }
        });
        assert!(tls_counter.get() == 1000);
    }

    #[test]
    fn printer_reports_progress() {
        let progress = Progress::new();
        progress.rows_read.add(5);
        progress.batches_built.add(2);
        progress.batches_written.inc();
        progress.rows_written.add(3);
        progress.bytes_written.add(1024);
        let mut printer = ProgressPrinter::new(&progress);
        let text = printer.print();
        assert!(text.contains("ROWS"));
        assert!(text.contains("BATCHES"));
    }
}
