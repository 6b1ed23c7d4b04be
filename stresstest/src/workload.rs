use std::io::{self, Read};
use std::thread::available_parallelism;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, LogNormal};

pub struct WorkloadBuilder {
    name: &'static str,
    concurrency: usize,
    seed: u64,

    p50_size: u64,
    p99_size: u64,

    max_chunks: u32,
    combine_racers: usize,
}

impl WorkloadBuilder {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.p50_size = p50;
        self.p99_size = p99;
        self
    }

    /// Uploads are split into between 1 and `max_chunks` chunks.
    pub fn max_chunks(mut self, max_chunks: u32) -> Self {
        self.max_chunks = max_chunks.max(1);
        self
    }

    /// How many combine requests are fired at once for every finished upload.
    pub fn combine_racers(mut self, combine_racers: usize) -> Self {
        self.combine_racers = combine_racers.max(1);
        self
    }

    pub fn build(self) -> anyhow::Result<Workload> {
        let rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_size as f64;
        let p99 = self.p99_size as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;
        let size_distribution = LogNormal::new(mu, sigma)?;

        Ok(Workload {
            config: WorkloadConfig {
                name: self.name,
                concurrency: self.concurrency,
                p50_size: self.p50_size,
                p99_size: self.p99_size,
                max_chunks: self.max_chunks,
                combine_racers: self.combine_racers,
            },
            rng,
            size_distribution,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub name: &'static str,
    pub concurrency: usize,
    pub p50_size: u64,
    pub p99_size: u64,
    pub max_chunks: u32,
    pub combine_racers: usize,
}

pub struct Workload {
    pub config: WorkloadConfig,

    /// The RNG driving all our distributions.
    rng: SmallRng,
    /// A distribution that generates upload sizes.
    size_distribution: LogNormal<f64>,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            concurrency: available_parallelism().map_or(4, |n| n.get()),
            seed: rand::random(),

            p50_size: 256 * 1024,
            p99_size: 16 * 1024 * 1024,

            max_chunks: 16,
            combine_racers: 2,
        }
    }

    fn get_payload(&self, seed: u64) -> Payload {
        let mut rng = SmallRng::seed_from_u64(seed);
        let len = self.size_distribution.sample(&mut rng) as u64;

        Payload { len, rng }
    }

    /// Generates the next file, already split into chunks in the order they should be sent.
    pub fn next_upload(&mut self) -> io::Result<Upload> {
        let seed = self.rng.next_u64();
        let mut bytes = Vec::new();
        self.get_payload(seed).read_to_end(&mut bytes)?;

        // never more chunks than bytes, but at least one, even for an empty file
        let max_chunks = self.config.max_chunks.min(bytes.len().max(1) as u32);
        let total_chunks = self.rng.random_range(1..=max_chunks);

        let len = bytes.len();
        let mut chunks: Vec<_> = (0..total_chunks)
            .map(|index| {
                let start = len * index as usize / total_chunks as usize;
                let end = len * (index as usize + 1) / total_chunks as usize;
                (index, bytes[start..end].to_vec())
            })
            .collect();
        chunks.shuffle(&mut self.rng);

        Ok(Upload {
            upload_id: format!("{}-{seed:016x}", self.config.name),
            original_name: format!("{seed:016x}.bin"),
            total_chunks,
            len: len as u64,
            hash: blake3::hash(&bytes),
            chunks,
        })
    }
}

pub struct Upload {
    pub upload_id: String,
    pub original_name: String,
    pub total_chunks: u32,
    pub len: u64,
    pub hash: blake3::Hash,
    /// `(chunk_index, bytes)`, shuffled.
    pub chunks: Vec<(u32, Vec<u8>)>,
}

pub struct Payload {
    pub len: u64,
    pub rng: SmallRng,
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len_to_fill = (buf.len() as u64).min(self.len) as usize;

        let fill_buf = &mut buf[..len_to_fill];
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        Ok(len_to_fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lognormal_percentiles_work() {
        let workload = Workload::builder("test")
            .size_distribution(100, 1000)
            .build()
            .unwrap();

        let mut sizes: Vec<_> = (0..1000)
            .map(|seed| workload.get_payload(seed).len)
            .collect();
        sizes.sort_unstable();

        let p50 = sizes[500];
        assert!((70..140).contains(&p50), "{p50}");
    }

    #[test]
    fn uploads_split_into_shuffled_chunks() {
        let mut workload = Workload::builder("test")
            .seed(42)
            .size_distribution(4096, 64 * 1024)
            .max_chunks(8)
            .build()
            .unwrap();

        for _ in 0..20 {
            let upload = workload.next_upload().unwrap();
            assert_eq!(upload.chunks.len(), upload.total_chunks as usize);
            assert!((1..=8).contains(&upload.total_chunks));

            let mut chunks = upload.chunks.clone();
            chunks.sort_by_key(|(index, _)| *index);
            let indices: Vec<_> = chunks.iter().map(|(index, _)| *index).collect();
            assert_eq!(indices, (0..upload.total_chunks).collect::<Vec<_>>());

            let bytes: Vec<u8> = chunks.into_iter().flat_map(|(_, bytes)| bytes).collect();
            assert_eq!(bytes.len() as u64, upload.len);
            assert_eq!(blake3::hash(&bytes), upload.hash);
        }
    }

    #[test]
    fn seeded_workloads_repeat() {
        let build = || {
            Workload::builder("test")
                .seed(7)
                .size_distribution(1000, 10_000)
                .build()
                .unwrap()
        };
        let (mut a, mut b) = (build(), build());
        for _ in 0..5 {
            let (a, b) = (a.next_upload().unwrap(), b.next_upload().unwrap());
            assert_eq!(a.upload_id, b.upload_id);
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.chunks, b.chunks);
        }
    }
}
