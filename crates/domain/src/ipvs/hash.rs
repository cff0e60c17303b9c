use std::net::Ipv4Addr;

/// Buckets in the 3-tuple service table.
pub const TUPLE_TAB_SIZE: usize = 256;
/// Buckets in the firewall-mark service table.
pub const MARK_TAB_SIZE: usize = 256;
/// Buckets in the real-server table.
pub const RS_TAB_SIZE: usize = 16;

pub fn tuple_hash(protocol: u16, addr: Ipv4Addr, port: u16) -> usize {
    let port = u32::from(port);
    let h = u32::from(protocol) ^ u32::from(addr) ^ (port >> 8) ^ port;
    (h as usize) & (TUPLE_TAB_SIZE - 1)
}

pub fn mark_hash(fwmark: u32) -> usize {
    (fwmark as usize) & (MARK_TAB_SIZE - 1)
}

pub fn real_hash(addr: Ipv4Addr, port: u16) -> usize {
    let port = u32::from(port);
    let h = u32::from(addr) ^ (port >> 4) ^ port;
    (h as usize) & (RS_TAB_SIZE - 1)
}

/// Open hash with a fixed number of buckets and per-bucket chains.
#[derive(Debug)]
pub struct HashIndex<T> {
    buckets: Vec<Vec<T>>,
    len: usize,
}

impl<T> HashIndex<T> {
    pub fn new(buckets: usize) -> Self {
        debug_assert!(buckets.is_power_of_two());
        Self {
            buckets: (0..buckets).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn insert(&mut self, hash: usize, value: T) {
        let n = self.buckets.len();
        self.buckets[hash & (n - 1)].push(value);
        self.len += 1;
    }

    /// Remove the first entry in the bucket matching `pred`.
    pub fn remove(&mut self, hash: usize, pred: impl Fn(&T) -> bool) -> Option<T> {
        let n = self.buckets.len();
        let chain = &mut self.buckets[hash & (n - 1)];
        let pos = chain.iter().position(pred)?;
        self.len -= 1;
        Some(chain.swap_remove(pos))
    }

    pub fn find(&self, hash: usize, pred: impl Fn(&T) -> bool) -> Option<&T> {
        let n = self.buckets.len();
        self.buckets[hash & (n - 1)].iter().find(|v| pred(v))
    }

    /// Entries in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buckets.iter().flatten()
    }

    pub fn clear(&mut self) -> Vec<T> {
        self.len = 0;
        self.buckets.iter_mut().flat_map(std::mem::take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_hash_formula() {
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let expected = (6 ^ 0x0A00_0001u32 ^ (80 >> 8) ^ 80) & 255;
        assert_eq!(tuple_hash(6, addr, 80), expected as usize);
        assert!(tuple_hash(17, Ipv4Addr::BROADCAST, 65535) < TUPLE_TAB_SIZE);
    }

    #[test]
    fn mark_hash_masks_low_byte() {
        assert_eq!(mark_hash(0x1234), 0x34);
        assert_eq!(mark_hash(256), 0);
    }

    #[test]
    fn real_hash_formula() {
        let addr = Ipv4Addr::new(192, 168, 1, 7);
        let expected = (u32::from(addr) ^ (8080 >> 4) ^ 8080) & 15;
        assert_eq!(real_hash(addr, 8080), expected as usize);
    }

    #[test]
    fn insert_find_remove() {
        let mut idx = HashIndex::new(16);
        idx.insert(3, "a");
        idx.insert(3 + 16, "b");
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.find(3, |v| *v == "b"), Some(&"b"));
        assert_eq!(idx.remove(3, |v| *v == "a"), Some("a"));
        assert_eq!(idx.remove(3, |v| *v == "a"), None);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn clear_drains_everything() {
        let mut idx = HashIndex::new(4);
        for i in 0..10 {
            idx.insert(i, i);
        }
        let mut all = idx.clear();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert!(idx.is_empty());
        assert_eq!(idx.iter().count(), 0);
    }
}
