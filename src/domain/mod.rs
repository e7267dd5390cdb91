// 領域層：記錄、表頭，以及管道所依賴的介面

pub mod model;
pub mod ports;
