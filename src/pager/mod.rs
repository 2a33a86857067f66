mod file_manager;
mod manager;
mod page;

pub(crate) use crate::pager::manager::{Pager, MIN_CACHE_PAGES};
pub(crate) use crate::pager::page::{
    init_data_page, init_first_page, Page, MAX_FREE_SPACE, PAGE_SIZE,
};
