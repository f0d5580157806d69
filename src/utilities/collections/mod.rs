pub mod lsb_radix_sort;
